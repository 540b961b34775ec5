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

//! # storage
//!
//! Abstractions for the shortstash storage layer. The rest of the crate writes to this narrow,
//! document-oriented contract; a particular *implementation* is chosen at startup.

use crate::entities::{ArtifactId, LinkRecord, MetadataStatus, PageMetadata, ShortCode};

use async_trait::async_trait;

use std::sync::Arc;

#[derive(Debug)]
pub struct Error {
    source: Box<dyn std::error::Error + Send + Sync + 'static>,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl std::error::Error for Error {}

impl Error {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error {
            source: Box::new(err),
        }
    }
}

#[async_trait]
pub trait Backend {
    /// Persist a new [LinkRecord]. Return true if the record was actually created, false if its
    /// short code is already taken (the backend's uniqueness check is the source of truth; the
    /// allocator's existence check is only a fast path, and two racing allocators may draw the
    /// same code).
    async fn insert_link(&self, link: &LinkRecord) -> Result<bool, Error>;
    /// Retrieve a [LinkRecord] by id. None means there is no record by that id.
    async fn get_link(&self, id: &ArtifactId) -> Result<Option<LinkRecord>, Error>;
    /// Is `code` assigned to *any* artifact? Note that short codes share one namespace across all
    /// artifact kinds, deleted records included.
    async fn short_code_exists(&self, code: &ShortCode) -> Result<bool, Error>;
    /// Advance the record's enrichment state machine & bump `updated_at`. This write is persisted
    /// independently of any metadata-field update so that pollers can observe `Processing` before
    /// the resolved fields land. Fails on an unknown id or an illegal transition.
    async fn set_metadata_status(
        &self,
        id: &ArtifactId,
        status: MetadataStatus,
    ) -> Result<(), Error>;
    /// Merge resolved metadata into the record (empty fields only) & bump `updated_at`. Fails on
    /// an unknown id.
    async fn apply_metadata(&self, id: &ArtifactId, metadata: &PageMetadata) -> Result<(), Error>;
    /// Case-insensitive substring search over url/title/description/tags, excluding soft-deleted
    /// records; `page` is 1-based. Returns the requested page along with the total match count.
    async fn search(
        &self,
        query: &str,
        page: usize,
        limit: usize,
    ) -> Result<(Vec<LinkRecord>, usize), Error>;
}

/// Blanket implementation for [Arc]s; if `T` is a [Backend], then so is `Arc<T>`.
#[async_trait]
impl<T: Backend + Send + Sync> Backend for Arc<T> {
    async fn insert_link(&self, link: &LinkRecord) -> Result<bool, Error> {
        self.as_ref().insert_link(link).await
    }
    async fn get_link(&self, id: &ArtifactId) -> Result<Option<LinkRecord>, Error> {
        self.as_ref().get_link(id).await
    }
    async fn short_code_exists(&self, code: &ShortCode) -> Result<bool, Error> {
        self.as_ref().short_code_exists(code).await
    }
    async fn set_metadata_status(
        &self,
        id: &ArtifactId,
        status: MetadataStatus,
    ) -> Result<(), Error> {
        self.as_ref().set_metadata_status(id, status).await
    }
    async fn apply_metadata(&self, id: &ArtifactId, metadata: &PageMetadata) -> Result<(), Error> {
        self.as_ref().apply_metadata(id, metadata).await
    }
    async fn search(
        &self,
        query: &str,
        page: usize,
        limit: usize,
    ) -> Result<(Vec<LinkRecord>, usize), Error> {
        self.as_ref().search(query, page, limit).await
    }
}
