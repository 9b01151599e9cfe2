//! Tree walker: builds an in-memory entry tree and drives recursive copy.
//!
//! Walks are depth-first. Cancellation is checked before every node, and the
//! task context's total grows as directories are discovered.

use std::path::PathBuf;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;

use super::entry::{EntryRef, open_reader};
use super::error::{DriveError, DriveResult};
use super::ops::Drive;
use super::path;
use super::stream::{COPY_BUFFER_SIZE, stage_to_temp};
use crate::task::TaskCtx;

/// A node of a walked subtree.
#[derive(Debug, Clone)]
pub struct EntryNode {
    pub entry: EntryRef,
    pub children: Vec<EntryNode>,
}

impl EntryNode {
    /// Number of nodes in this subtree, including `self`.
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(EntryNode::count).sum::<usize>()
    }
}

/// Walk the subtree rooted at `root` using `drive.list`.
///
/// `root` must be an entry of `drive`. Children are visited in name order.
#[tracing::instrument(skip(ctx, drive, root), fields(root = %root.path()), name = "tree.build")]
pub async fn build_tree(ctx: &TaskCtx, drive: &dyn Drive, root: EntryRef) -> DriveResult<EntryNode> {
    ctx.total(1, false);
    build_node(ctx, drive, root).await
}

fn build_node<'a>(
    ctx: &'a TaskCtx,
    drive: &'a dyn Drive,
    entry: EntryRef,
) -> BoxFuture<'a, DriveResult<EntryNode>> {
    async move {
        ctx.check()?;
        if entry.kind().is_file() {
            return Ok(EntryNode {
                entry,
                children: Vec::new(),
            });
        }
        let mut children = drive.list(entry.path()).await?;
        children.sort_by(|a, b| a.name().cmp(b.name()));
        ctx.total(children.len() as i64, false);

        let mut nodes = Vec::with_capacity(children.len());
        for child in children {
            nodes.push(build_node(ctx, drive, child).await?);
        }
        Ok(EntryNode {
            entry,
            children: nodes,
        })
    }
    .boxed()
}

/// Entries of the tree in pre-order (parents before children).
pub fn flatten(tree: &EntryNode) -> Vec<EntryRef> {
    let mut out = Vec::with_capacity(tree.count());
    fn visit(node: &EntryNode, out: &mut Vec<EntryRef>) {
        out.push(node.entry.clone());
        for child in &node.children {
            visit(child, out);
        }
    }
    visit(tree, &mut out);
    out
}

/// Entries of the tree in post-order (children before parents).
pub fn flatten_post_order(tree: &EntryNode) -> Vec<EntryRef> {
    let mut out = Vec::with_capacity(tree.count());
    fn visit(node: &EntryNode, out: &mut Vec<EntryRef>) {
        for child in &node.children {
            visit(child, out);
        }
        out.push(node.entry.clone());
    }
    visit(tree, &mut out);
    out
}

/// Per-node callbacks for [`copy_all`].
#[async_trait]
pub trait CopyHooks: Send + Sync {
    /// Copy a single file to `dst_path` on `dst`. Existence checks have
    /// already been made, so implementations may overwrite.
    async fn copy_one(
        &self,
        ctx: &TaskCtx,
        src: &EntryRef,
        dst: &dyn Drive,
        dst_path: &str,
    ) -> DriveResult<()>;

    /// Called after each node (post-order). `fully_processed` is false when
    /// something in the node's subtree was skipped.
    async fn after(
        &self,
        _ctx: &TaskCtx,
        _entry: &EntryRef,
        _fully_processed: bool,
    ) -> DriveResult<()> {
        Ok(())
    }
}

/// Default per-file copy: stage the source in a temp file, then `save`.
#[derive(Debug, Clone)]
pub struct StagedCopy {
    temp_dir: PathBuf,
    buffer_size: usize,
}

impl StagedCopy {
    pub fn new(temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            temp_dir: temp_dir.into(),
            buffer_size: COPY_BUFFER_SIZE,
        }
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }
}

#[async_trait]
impl CopyHooks for StagedCopy {
    async fn copy_one(
        &self,
        ctx: &TaskCtx,
        src: &EntryRef,
        dst: &dyn Drive,
        dst_path: &str,
    ) -> DriveResult<()> {
        let reader = open_reader(src.as_ref()).await?;
        let staged = stage_to_temp(ctx, &self.temp_dir, reader, self.buffer_size).await?;
        let size = staged.size() as i64;
        dst.save(ctx, dst_path, size, true, staged.reader().await?).await?;
        Ok(())
    }
}

/// Recursively copy `tree` to `dst_path` on `dst`.
///
/// Directories are created when missing and merged when present. Existing
/// files are skipped unless `overwrite` is set; a skip marks the subtree as
/// not fully processed. A type clash (file over directory or the reverse)
/// fails with not-allowed. The walk stops at the first error; work already
/// done is left in place.
///
/// Returns whether the whole tree was processed.
#[tracing::instrument(skip(ctx, tree, dst, hooks), fields(src = %tree.entry.path()), name = "tree.copy_all")]
pub async fn copy_all(
    ctx: &TaskCtx,
    tree: &EntryNode,
    dst: &dyn Drive,
    dst_path: &str,
    overwrite: bool,
    hooks: &dyn CopyHooks,
) -> DriveResult<bool> {
    let mut processed = 0i64;
    copy_node(
        ctx,
        tree,
        dst,
        dst_path.to_string(),
        overwrite,
        hooks,
        &mut processed,
    )
    .await
}

fn copy_node<'a>(
    ctx: &'a TaskCtx,
    node: &'a EntryNode,
    dst: &'a dyn Drive,
    dst_path: String,
    overwrite: bool,
    hooks: &'a dyn CopyHooks,
    processed: &'a mut i64,
) -> BoxFuture<'a, DriveResult<bool>> {
    async move {
        ctx.check()?;
        let existing = dst.get_opt(&dst_path).await?;
        let mut fully_processed = true;

        if node.entry.kind().is_dir() {
            match existing {
                Some(e) if e.kind().is_file() => {
                    return Err(DriveError::not_allowed(format!(
                        "{dst_path} is a file, cannot copy a directory over it"
                    )));
                }
                Some(_) => {}
                None => {
                    dst.make_dir(&dst_path).await?;
                }
            }
            for child in &node.children {
                let child_dst = path::join(&dst_path, child.entry.name());
                let child_done =
                    copy_node(ctx, child, dst, child_dst, overwrite, hooks, &mut *processed)
                        .await?;
                fully_processed &= child_done;
            }
        } else {
            match existing {
                Some(e) if e.kind().is_dir() => {
                    return Err(DriveError::not_allowed(format!(
                        "{dst_path} is a directory, cannot copy a file over it"
                    )));
                }
                Some(_) if !overwrite => {
                    tracing::debug!("skipping existing {}", dst_path);
                    fully_processed = false;
                }
                _ => {
                    hooks.copy_one(&ctx.child(), &node.entry, dst, &dst_path).await?;
                }
            }
        }

        *processed += 1;
        ctx.progress(*processed, true);
        hooks.after(ctx, &node.entry, fully_processed).await?;
        Ok(fully_processed)
    }
    .boxed()
}
