// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of shortstash.
//
// shortstash is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// shortstash is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with shortstash.  If not,
// see <http://www.gnu.org/licenses/>.

//! # In-memory storage backend
//!
//! A [Backend] implementation over process memory. This is the development & test backend; it
//! also serves as the reference semantics for the contract (in particular, short-code uniqueness
//! enforced at insert, and status writes independent of field writes).

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use snafu::prelude::*;
use tokio::sync::RwLock;

use crate::{
    entities::{ArtifactId, LinkRecord, LifecycleStatus, MetadataStatus, PageMetadata, ShortCode},
    storage::{Backend, Error as StorageError},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("No record with id {id}"))]
    UnknownId { id: ArtifactId },
}

/// Records keyed by id, plus the set of assigned short codes
///
/// The short-code set spans *all* artifacts ever inserted (shortstash never hard-deletes), which
/// is what makes `insert_link`'s uniqueness check authoritative.
#[derive(Default)]
pub struct MemoryBackend {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    records: HashMap<ArtifactId, LinkRecord>,
    short_codes: HashSet<ShortCode>,
}

impl MemoryBackend {
    pub fn new() -> MemoryBackend {
        MemoryBackend::default()
    }
    /// Reserve a short code without a backing record, as the file-upload surface would. Used to
    /// exercise the shared-namespace behavior in tests.
    pub async fn reserve_short_code(&self, code: ShortCode) {
        self.inner.write().await.short_codes.insert(code);
    }
    /// Soft-delete a record. Record management proper lives outside this crate; this exists so
    /// the search path's visibility rule can be exercised.
    pub async fn mark_deleted(&self, id: &ArtifactId) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        let rec = inner
            .records
            .get_mut(id)
            .ok_or_else(|| StorageError::new(UnknownIdSnafu { id: *id }.build()))?;
        rec.mark_deleted();
        Ok(())
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn insert_link(&self, link: &LinkRecord) -> Result<bool, StorageError> {
        let mut inner = self.inner.write().await;
        if inner.short_codes.contains(link.short_code()) {
            return Ok(false);
        }
        inner.short_codes.insert(link.short_code().clone());
        inner.records.insert(link.id(), link.clone());
        Ok(true)
    }
    async fn get_link(&self, id: &ArtifactId) -> Result<Option<LinkRecord>, StorageError> {
        Ok(self.inner.read().await.records.get(id).cloned())
    }
    async fn short_code_exists(&self, code: &ShortCode) -> Result<bool, StorageError> {
        Ok(self.inner.read().await.short_codes.contains(code))
    }
    async fn set_metadata_status(
        &self,
        id: &ArtifactId,
        status: MetadataStatus,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        let rec = inner
            .records
            .get_mut(id)
            .ok_or_else(|| StorageError::new(UnknownIdSnafu { id: *id }.build()))?;
        rec.advance_metadata_status(status).map_err(StorageError::new)
    }
    async fn apply_metadata(
        &self,
        id: &ArtifactId,
        metadata: &PageMetadata,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        let rec = inner
            .records
            .get_mut(id)
            .ok_or_else(|| StorageError::new(UnknownIdSnafu { id: *id }.build()))?;
        rec.absorb_metadata(metadata);
        Ok(())
    }
    async fn search(
        &self,
        query: &str,
        page: usize,
        limit: usize,
    ) -> Result<(Vec<LinkRecord>, usize), StorageError> {
        let inner = self.inner.read().await;
        let mut matches: Vec<&LinkRecord> = inner
            .records
            .values()
            .filter(|r| r.status() == LifecycleStatus::Active && r.matches(query))
            .collect();
        matches.sort_by(|a, b| b.created_at().cmp(&a.created_at()));
        let total = matches.len();
        let skip = page.saturating_sub(1) * limit;
        Ok((
            matches.into_iter().skip(skip).take(limit).cloned().collect(),
            total,
        ))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::entities::{CategoryName, LinkUrl, Tagname};

    fn record(code: &str, url: &str, tags: &[&str]) -> LinkRecord {
        LinkRecord::new(
            ShortCode::new(code).unwrap(),
            LinkUrl::new(url).unwrap(),
            PageMetadata::default(),
            vec![CategoryName::new("misc").unwrap()],
            tags.iter().map(|t| Tagname::new(t).unwrap()).collect(),
            "127.0.0.1".parse().unwrap(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn insert_enforces_short_code_uniqueness() {
        let backend = MemoryBackend::new();
        let first = record("AAAAAA", "https://a.example.com", &[]);
        let second = record("AAAAAA", "https://b.example.com", &[]);
        assert!(backend.insert_link(&first).await.unwrap());
        assert!(!backend.insert_link(&second).await.unwrap());
        assert!(backend
            .short_code_exists(&ShortCode::new("AAAAAA").unwrap())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn shared_namespace() {
        let backend = MemoryBackend::new();
        backend
            .reserve_short_code(ShortCode::new("FILE42").unwrap())
            .await;
        let link = record("FILE42", "https://a.example.com", &[]);
        assert!(!backend.insert_link(&link).await.unwrap());
    }

    #[tokio::test]
    async fn status_writes_are_independent() {
        let backend = MemoryBackend::new();
        let rec = record("AAAAAB", "https://a.example.com", &[]);
        let id = rec.id();
        backend.insert_link(&rec).await.unwrap();

        backend
            .set_metadata_status(&id, MetadataStatus::Processing)
            .await
            .unwrap();
        // A poller sees PROCESSING before any fields have landed
        let seen = backend.get_link(&id).await.unwrap().unwrap();
        assert_eq!(seen.metadata_status(), MetadataStatus::Processing);
        assert_eq!(seen.title(), None);

        backend
            .apply_metadata(
                &id,
                &PageMetadata {
                    title: Some("t".to_owned()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        backend
            .set_metadata_status(&id, MetadataStatus::Completed)
            .await
            .unwrap();
        let seen = backend.get_link(&id).await.unwrap().unwrap();
        assert_eq!(seen.metadata_status(), MetadataStatus::Completed);
        assert_eq!(seen.title(), Some("t"));
        assert!(seen.updated_at() > seen.created_at());
    }

    #[tokio::test]
    async fn illegal_transition_rejected() {
        let backend = MemoryBackend::new();
        let rec = record("AAAAAC", "https://a.example.com", &[]);
        let id = rec.id();
        backend.insert_link(&rec).await.unwrap();
        assert!(backend
            .set_metadata_status(&id, MetadataStatus::Completed)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn search_excludes_deleted() {
        let backend = MemoryBackend::new();
        let kept = record("AAAAAD", "https://rust-lang.org", &["rust"]);
        let dropped = record("AAAAAE", "https://rust-analyzer.github.io", &["rust"]);
        backend.insert_link(&kept).await.unwrap();
        backend.insert_link(&dropped).await.unwrap();
        backend.mark_deleted(&dropped.id()).await.unwrap();

        let (records, total) = backend.search("rust", 1, 10).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id(), kept.id());
    }

    #[tokio::test]
    async fn search_paginates() {
        let backend = MemoryBackend::new();
        for (n, code) in ["AAAAA1", "AAAAA2", "AAAAA3"].iter().enumerate() {
            let rec = record(code, &format!("https://example.com/{}", n), &[]);
            backend.insert_link(&rec).await.unwrap();
        }
        let (page1, total) = backend.search("example", 1, 2).await.unwrap();
        assert_eq!((page1.len(), total), (2, 3));
        let (page2, _) = backend.search("example", 2, 2).await.unwrap();
        assert_eq!(page2.len(), 1);
        let (page3, _) = backend.search("example", 3, 2).await.unwrap();
        assert!(page3.is_empty());
    }
}
