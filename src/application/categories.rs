use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::application::outcomes::{CategoryMoveOutcome, merge_chains, post_count_outcomes};
use crate::application::repos::{CategoriesWriteRepo, CategoryRecord, DeletedCategory, RepoError};
use crate::cache::{CacheCoordinator, CoordinatorError};
use crate::domain::error::DomainError;
use crate::domain::{FileStats, HierarchyError, MAX_DEPTH, NodeId};

#[derive(Debug, Error)]
pub enum CategoryServiceError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Hierarchy(#[from] HierarchyError),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

/// What to do with descendants when deleting a category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeletePolicy {
    /// Fail with `HasChildren` if the category has subcategories.
    #[default]
    Refuse,
    /// Delete the whole subtree, deepest categories first.
    Cascade,
}

#[derive(Clone)]
pub struct CategoryService {
    writer: Arc<dyn CategoriesWriteRepo>,
    cache: Arc<CacheCoordinator>,
}

impl CategoryService {
    pub fn new(writer: Arc<dyn CategoriesWriteRepo>, cache: Arc<CacheCoordinator>) -> Self {
        Self { writer, cache }
    }

    pub async fn create(
        &self,
        parent: Option<NodeId>,
        name: &str,
        description: Option<&str>,
    ) -> Result<CategoryRecord, CategoryServiceError> {
        validate_name(name)?;
        let _mutation = self.cache.begin_mutation().await;
        if let Some(parent) = parent {
            let node = self
                .cache
                .hierarchy()
                .get(parent)
                .ok_or_else(|| DomainError::not_found("category", parent))?;
            if node.depth >= MAX_DEPTH {
                return Err(DomainError::validation(format!(
                    "category `{parent}` is at maximum depth {MAX_DEPTH} and cannot have children"
                ))
                .into());
            }
        }

        let record = self.writer.create_category(parent, name, description).await?;
        self.cache.on_category_created(record.id, record.parent_id)?;
        info!(category = %record.id, parent = ?record.parent_id, "Category created");
        Ok(record)
    }

    /// Rename or re-describe a category. Aggregates are unaffected.
    pub async fn update_metadata(
        &self,
        id: NodeId,
        name: &str,
        description: Option<&str>,
    ) -> Result<CategoryRecord, CategoryServiceError> {
        validate_name(name)?;
        Ok(self
            .writer
            .update_category_metadata(id, name, description)
            .await?)
    }

    /// Reparent a category. The move is validated against the tree before
    /// anything is written, so a depth violation never reaches the store.
    ///
    /// Other mutations are held off for the duration, so the subtree delta
    /// read here is the one the store moves.
    pub async fn move_to(
        &self,
        id: NodeId,
        new_parent: Option<NodeId>,
    ) -> Result<CategoryMoveOutcome, CategoryServiceError> {
        let _mutation = self.cache.begin_structural_mutation().await;
        let hierarchy = self.cache.hierarchy();
        let node = hierarchy.get(id).ok_or(HierarchyError::UnknownNode(id))?;
        let old_parent = node.parent_id;

        if old_parent == new_parent {
            return Ok(CategoryMoveOutcome {
                node: id,
                old_parent,
                new_parent,
                delta: FileStats::ZERO,
                post_counts: Vec::new(),
            });
        }

        hierarchy.check_reparent(id, new_parent)?;
        // Queued attachment events must land before the subtree total is read.
        self.cache.flush();
        let delta = self.cache.get_file_stats(id, true).await?;

        self.writer.move_category(id, new_parent).await?;
        self.cache.on_category_moved(id, old_parent, new_parent, delta)?;
        info!(
            category = %id,
            ?old_parent,
            ?new_parent,
            files = delta.file_count,
            bytes = delta.total_size,
            "Category moved"
        );

        let affected = merge_chains(
            hierarchy.chain_from(old_parent),
            hierarchy.chain(id),
        );
        Ok(CategoryMoveOutcome {
            node: id,
            old_parent,
            new_parent,
            delta,
            post_counts: post_count_outcomes(&self.cache, &affected),
        })
    }

    /// Delete a category with its posts and attachments.
    pub async fn delete(
        &self,
        id: NodeId,
        policy: DeletePolicy,
    ) -> Result<Vec<DeletedCategory>, CategoryServiceError> {
        let _mutation = self.cache.begin_structural_mutation().await;
        let hierarchy = self.cache.hierarchy();
        if !hierarchy.contains(id) {
            return Err(HierarchyError::UnknownNode(id).into());
        }

        let mut order = hierarchy.descendants(id);
        if !order.is_empty() && policy == DeletePolicy::Refuse {
            return Err(HierarchyError::HasChildren {
                node: id,
                children: hierarchy.children(id).len(),
            }
            .into());
        }
        order.reverse();
        order.push(id);

        let mut deleted = Vec::with_capacity(order.len());
        for victim in order {
            let removed = self.writer.delete_category(victim).await?;
            for post in &removed.posts {
                self.cache.on_post_deleted(post.category, post.published_on)?;
            }
            for file in &removed.files {
                self.cache.on_file_deleted(file.category, file.size_bytes)?;
            }
            self.cache.on_category_removed(victim)?;
            info!(
                category = %victim,
                cascade = victim != id,
                posts = removed.posts.len(),
                files = removed.files.len(),
                "Category deleted"
            );
            deleted.push(removed);
        }
        Ok(deleted)
    }
}

fn validate_name(name: &str) -> Result<(), DomainError> {
    if name.trim().is_empty() {
        return Err(DomainError::validation("category name must not be empty"));
    }
    Ok(())
}
