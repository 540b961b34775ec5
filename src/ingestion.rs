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

//! # Link ingestion
//!
//! [Service] orchestrates the submission path: validate, allocate a short code, persist, dispatch
//! enrichment, return. The contract that shapes everything here is the *propagation policy*:
//! anything that goes wrong before the initial persist is the caller's problem, synchronously;
//! anything after is visible only as record state, to be polled. In particular a submission
//! returns as soon as the record is durable-- the caller never waits on a provider's network
//! round-trip, and never receives a delayed enrichment error.

use std::{net::IpAddr, sync::Arc};

use snafu::{prelude::*, Backtrace};
use tracing::{debug, warn};

use crate::{
    background::{self, Sender},
    entities::{
        self, ArtifactId, CategoryName, LinkRecord, LinkUrl, MetadataStatus, PageMetadata, Tagname,
    },
    enrichment::{Context, EnrichLink},
    short_code::{self, Allocator},
    storage::{self, Backend as StorageBackend},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to allocate a short code: {source}"))]
    Allocation { source: short_code::Error },
    #[snafu(display("Couldn't persist a record after {attempts} allocation attempts"))]
    Duplicate { attempts: usize, backtrace: Backtrace },
    #[snafu(display("{source}"))]
    Invalid { source: entities::Error },
    #[snafu(display("No record with id {id}"))]
    NotFound { id: ArtifactId },
    #[snafu(display("Failed to enqueue an enrichment task: {source}"))]
    Queue { source: background::Error },
    #[snafu(display("Storage failure: {source}"))]
    Storage { source: storage::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

/// The allocator's existence check & the insert are not atomic, so an insert can still lose a
/// race; each loss costs one re-allocation. Losing this many in a row isn't a race anymore.
const MAX_INSERT_ATTEMPTS: usize = 3;

/// One link as submitted by a caller, before validation
#[derive(Clone, Debug, Default)]
pub struct Submission {
    pub url: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub thumbnail: Option<String>,
    pub categories: Vec<String>,
    pub tags: Vec<String>,
}

/// The outcome of a batch submission; items succeed & fail independently
#[derive(Debug)]
pub struct BatchOutcome {
    pub files: Vec<LinkRecord>,
    pub errors: Vec<BatchError>,
    /// True iff `errors` is empty
    pub success: bool,
}

/// A per-item failure, keyed by the URL exactly as the caller submitted it
#[derive(Debug)]
pub struct BatchError {
    pub url: String,
    pub message: String,
}

/// A record's enrichment state as reported to pollers
///
/// `metadata` is populated only in the `COMPLETED` state; a poller watching `PROCESSING` gets no
/// partial data, by choice.
#[derive(Debug)]
pub struct StatusView {
    pub status: MetadataStatus,
    pub metadata: Option<PageMetadata>,
}

fn non_blank(field: Option<String>) -> Option<String> {
    field
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
}

pub struct Service {
    storage: Arc<dyn StorageBackend + Send + Sync>,
    allocator: Allocator,
    queue: Arc<dyn Sender<Context, EnrichLink> + Send + Sync>,
}

impl Service {
    pub fn new(
        storage: Arc<dyn StorageBackend + Send + Sync>,
        queue: Arc<dyn Sender<Context, EnrichLink> + Send + Sync>,
    ) -> Service {
        let allocator = Allocator::new(storage.clone());
        Service {
            storage,
            allocator,
            queue,
        }
    }
    /// Validate & persist one submission, dispatch its enrichment, and return the stored record
    ///
    /// The returned record is in the `PENDING` state; enrichment proceeds in the background.
    pub async fn submit_one(
        &self,
        submission: Submission,
        uploader_ip: IpAddr,
    ) -> Result<LinkRecord> {
        let url = LinkUrl::new(&submission.url).context(InvalidSnafu)?;
        let categories = submission
            .categories
            .iter()
            .map(|c| CategoryName::new(c))
            .collect::<entities::Result<Vec<_>>>()
            .context(InvalidSnafu)?;
        let tags = submission
            .tags
            .iter()
            .map(|t| Tagname::new(t))
            .collect::<entities::Result<Vec<_>>>()
            .context(InvalidSnafu)?;
        let overrides = PageMetadata {
            title: non_blank(submission.title),
            description: non_blank(submission.description),
            thumbnail: non_blank(submission.thumbnail),
        };

        for attempt in 0..MAX_INSERT_ATTEMPTS {
            let code = self.allocator.allocate().await.context(AllocationSnafu)?;
            let record = LinkRecord::new(
                code,
                url.clone(),
                overrides.clone(),
                categories.clone(),
                tags.clone(),
                uploader_ip,
            )
            .context(InvalidSnafu)?;
            if self
                .storage
                .insert_link(&record)
                .await
                .context(StorageSnafu)?
            {
                self.dispatch(&record).await;
                return Ok(record);
            }
            // Another writer claimed the code between our existence check & the insert
            debug!(
                "Short code {} was taken at insert (attempt {}); re-allocating",
                record.short_code().as_ref(),
                attempt + 1
            );
        }
        DuplicateSnafu {
            attempts: MAX_INSERT_ATTEMPTS,
        }
        .fail()
    }
    /// Submit several links in one call
    ///
    /// `global_categories` & `global_tags` are concatenated onto each item's own (duplicates
    /// permitted). Items are processed independently; a bad item lands in `errors` under its
    /// original URL & the rest proceed.
    pub async fn submit_batch(
        &self,
        items: Vec<Submission>,
        global_categories: Vec<String>,
        global_tags: Vec<String>,
        uploader_ip: IpAddr,
    ) -> Result<BatchOutcome> {
        let mut files = Vec::new();
        let mut errors = Vec::new();
        for mut item in items {
            let url = item.url.clone();
            item.categories.extend(global_categories.iter().cloned());
            item.tags.extend(global_tags.iter().cloned());
            match self.submit_one(item, uploader_ip).await {
                Ok(record) => files.push(record),
                Err(err) => errors.push(BatchError {
                    url,
                    message: err.to_string(),
                }),
            }
        }
        let success = errors.is_empty();
        Ok(BatchOutcome {
            files,
            errors,
            success,
        })
    }
    /// Re-dispatch enrichment for an existing record
    ///
    /// Idempotent in the sense that it may be called repeatedly; each call restarts the forward
    /// path from `PROCESSING`.
    pub async fn retry(&self, id: &ArtifactId) -> Result<()> {
        let record = self
            .storage
            .get_link(id)
            .await
            .context(StorageSnafu)?
            .ok_or_else(|| NotFoundSnafu { id: *id }.build())?;
        self.queue
            .send(EnrichLink::new(record.id(), record.url().clone()))
            .await
            .context(QueueSnafu)
    }
    /// Report a record's enrichment status; the metadata triple rides along only once terminal &
    /// successful
    pub async fn get_status(&self, id: &ArtifactId) -> Result<StatusView> {
        let record = self
            .storage
            .get_link(id)
            .await
            .context(StorageSnafu)?
            .ok_or_else(|| NotFoundSnafu { id: *id }.build())?;
        let status = record.metadata_status();
        let metadata = (status == MetadataStatus::Completed).then(|| record.metadata());
        Ok(StatusView { status, metadata })
    }
    /// Case-insensitive substring search over url/title/description/tags
    pub async fn search(
        &self,
        query: &str,
        page: usize,
        limit: usize,
    ) -> Result<(Vec<LinkRecord>, usize)> {
        self.storage
            .search(query, page, limit)
            .await
            .context(StorageSnafu)
    }
    async fn dispatch(&self, record: &LinkRecord) {
        // The record is durable; per the propagation policy nothing from here on may reach the
        // submitter. A failed enqueue leaves the record PENDING, recoverable via retry.
        if let Err(err) = self
            .queue
            .send(EnrichLink::new(record.id(), record.url().clone()))
            .await
        {
            warn!(
                "Failed to enqueue enrichment for {}: {}",
                record.id(),
                err
            );
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::{
        sync::atomic::{AtomicBool, Ordering},
        time::{Duration, Instant},
    };

    use async_trait::async_trait;
    use tokio::sync::Mutex;
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use crate::{
        background::{Receiver, TaskQueue},
        entities::ShortCode,
        memory::MemoryBackend,
        metadata::{Provider, Resolver, Shape, Target},
        storage::Error as StorageError,
    };

    const IP: IpAddr = IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);

    fn submission(url: &str) -> Submission {
        Submission {
            url: url.to_owned(),
            categories: vec!["misc".to_owned()],
            ..Default::default()
        }
    }

    fn service_over(
        storage: Arc<dyn StorageBackend + Send + Sync>,
    ) -> (Service, Arc<TaskQueue<Context>>) {
        let queue = Arc::new(TaskQueue::new());
        (Service::new(storage, queue.clone()), queue)
    }

    fn resolver_against(server: &MockServer) -> Arc<Resolver> {
        Arc::new(
            Resolver::with_providers(vec![Provider::new(
                "test",
                Target::Prefixed(format!("{}/resolve?url=", server.uri())),
                Shape::JsonFlat,
            )])
            .unwrap(),
        )
    }

    /// Run every queued task to completion, as the processor would
    async fn drain(queue: &TaskQueue<Context>, context: &Context) {
        while let Some((task, cookie)) = queue.take_task().await.unwrap() {
            task.exec(context.clone()).await.unwrap();
            queue.mark_complete(cookie).await.unwrap();
        }
    }

    #[tokio::test]
    async fn submission_does_not_wait_on_the_resolver() {
        let server = MockServer::start().await;
        // A provider slow enough that waiting on it would be unmistakable
        Mock::given(method("GET"))
            .and(path("/resolve"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"title":"slow"}"#)
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;
        let storage = Arc::new(MemoryBackend::new());
        let (service, _queue) = service_over(storage);

        let before = Instant::now();
        let record = service
            .submit_one(submission("https://example.com"), IP)
            .await
            .unwrap();
        assert!(before.elapsed() < Duration::from_secs(1));
        assert_eq!(record.metadata_status(), MetadataStatus::Pending);
    }

    /// A [Backend] wrapper that records every status transition it's asked to make
    struct Recording {
        inner: MemoryBackend,
        transitions: Mutex<Vec<MetadataStatus>>,
    }

    #[async_trait]
    impl StorageBackend for Recording {
        async fn insert_link(&self, link: &LinkRecord) -> std::result::Result<bool, StorageError> {
            self.inner.insert_link(link).await
        }
        async fn get_link(
            &self,
            id: &ArtifactId,
        ) -> std::result::Result<Option<LinkRecord>, StorageError> {
            self.inner.get_link(id).await
        }
        async fn short_code_exists(
            &self,
            code: &ShortCode,
        ) -> std::result::Result<bool, StorageError> {
            self.inner.short_code_exists(code).await
        }
        async fn set_metadata_status(
            &self,
            id: &ArtifactId,
            status: MetadataStatus,
        ) -> std::result::Result<(), StorageError> {
            self.transitions.lock().await.push(status);
            self.inner.set_metadata_status(id, status).await
        }
        async fn apply_metadata(
            &self,
            id: &ArtifactId,
            metadata: &PageMetadata,
        ) -> std::result::Result<(), StorageError> {
            self.inner.apply_metadata(id, metadata).await
        }
        async fn search(
            &self,
            query: &str,
            page: usize,
            limit: usize,
        ) -> std::result::Result<(Vec<LinkRecord>, usize), StorageError> {
            self.inner.search(query, page, limit).await
        }
    }

    #[tokio::test]
    async fn states_advance_in_order() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/resolve"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"title":"t"}"#))
            .mount(&server)
            .await;
        let storage = Arc::new(Recording {
            inner: MemoryBackend::new(),
            transitions: Mutex::new(Vec::new()),
        });
        let (service, queue) = service_over(storage.clone());

        let record = service
            .submit_one(submission("https://example.com"), IP)
            .await
            .unwrap();
        assert_eq!(record.metadata_status(), MetadataStatus::Pending);

        let context = Context {
            storage: storage.clone() as Arc<dyn StorageBackend + Send + Sync>,
            resolver: resolver_against(&server),
        };
        drain(&queue, &context).await;

        assert_eq!(
            *storage.transitions.lock().await,
            vec![MetadataStatus::Processing, MetadataStatus::Completed]
        );
        let seen = storage.get_link(&record.id()).await.unwrap().unwrap();
        assert_eq!(seen.metadata_status(), MetadataStatus::Completed);
    }

    #[tokio::test]
    async fn batch_failures_are_per_item() {
        let storage = Arc::new(MemoryBackend::new());
        let (service, _queue) = service_over(storage);

        let outcome = service
            .submit_batch(
                vec![
                    Submission {
                        url: "https://a.com".to_owned(),
                        ..Default::default()
                    },
                    Submission {
                        url: "not-a-url".to_owned(),
                        ..Default::default()
                    },
                ],
                vec!["shared".to_owned()],
                vec![],
                IP,
            )
            .await
            .unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.files.len(), 1);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].url, "not-a-url");
        // the global category reached the good item
        assert_eq!(outcome.files[0].categories()[0].as_ref(), "shared");
    }

    /// A [Backend] wrapper whose `apply_metadata` fails while `failing` is set
    struct Flaky {
        inner: MemoryBackend,
        failing: AtomicBool,
    }

    #[derive(Debug, snafu::Snafu)]
    #[snafu(display("injected failure"))]
    struct Injected;

    #[async_trait]
    impl StorageBackend for Flaky {
        async fn insert_link(&self, link: &LinkRecord) -> std::result::Result<bool, StorageError> {
            self.inner.insert_link(link).await
        }
        async fn get_link(
            &self,
            id: &ArtifactId,
        ) -> std::result::Result<Option<LinkRecord>, StorageError> {
            self.inner.get_link(id).await
        }
        async fn short_code_exists(
            &self,
            code: &ShortCode,
        ) -> std::result::Result<bool, StorageError> {
            self.inner.short_code_exists(code).await
        }
        async fn set_metadata_status(
            &self,
            id: &ArtifactId,
            status: MetadataStatus,
        ) -> std::result::Result<(), StorageError> {
            self.inner.set_metadata_status(id, status).await
        }
        async fn apply_metadata(
            &self,
            id: &ArtifactId,
            metadata: &PageMetadata,
        ) -> std::result::Result<(), StorageError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StorageError::new(Injected));
            }
            self.inner.apply_metadata(id, metadata).await
        }
        async fn search(
            &self,
            query: &str,
            page: usize,
            limit: usize,
        ) -> std::result::Result<(Vec<LinkRecord>, usize), StorageError> {
            self.inner.search(query, page, limit).await
        }
    }

    #[tokio::test]
    async fn retry_restarts_the_forward_path() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/resolve"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"title":"t"}"#))
            .mount(&server)
            .await;
        let storage = Arc::new(Flaky {
            inner: MemoryBackend::new(),
            failing: AtomicBool::new(true),
        });
        let (service, queue) = service_over(storage.clone());
        let context = Context {
            storage: storage.clone() as Arc<dyn StorageBackend + Send + Sync>,
            resolver: resolver_against(&server),
        };

        let record = service
            .submit_one(submission("https://example.com"), IP)
            .await
            .unwrap();
        let id = record.id();
        drain(&queue, &context).await;
        let seen = storage.get_link(&id).await.unwrap().unwrap();
        assert_eq!(seen.metadata_status(), MetadataStatus::Failed);

        // First retry: still failing, cycles FAILED -> PROCESSING -> FAILED
        service.retry(&id).await.unwrap();
        drain(&queue, &context).await;
        let seen = storage.get_link(&id).await.unwrap().unwrap();
        assert_eq!(seen.metadata_status(), MetadataStatus::Failed);

        // Second retry after the fault clears: FAILED -> PROCESSING -> COMPLETED
        storage.failing.store(false, Ordering::SeqCst);
        service.retry(&id).await.unwrap();
        drain(&queue, &context).await;
        let seen = storage.get_link(&id).await.unwrap().unwrap();
        assert_eq!(seen.metadata_status(), MetadataStatus::Completed);
        assert_eq!(seen.title(), Some("t"));
    }

    #[tokio::test]
    async fn retry_of_an_unknown_record_is_not_found() {
        let storage = Arc::new(MemoryBackend::new());
        let (service, _queue) = service_over(storage);
        assert!(matches!(
            service.retry(&ArtifactId::new()).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn status_withholds_metadata_until_completed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/resolve"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"title":"t"}"#))
            .mount(&server)
            .await;
        let storage = Arc::new(MemoryBackend::new());
        let (service, queue) = service_over(storage.clone());

        let record = service
            .submit_one(submission("https://example.com"), IP)
            .await
            .unwrap();
        let id = record.id();

        let view = service.get_status(&id).await.unwrap();
        assert_eq!(view.status, MetadataStatus::Pending);
        assert!(view.metadata.is_none());

        let context = Context {
            storage: storage.clone() as Arc<dyn StorageBackend + Send + Sync>,
            resolver: resolver_against(&server),
        };
        drain(&queue, &context).await;

        let view = service.get_status(&id).await.unwrap();
        assert_eq!(view.status, MetadataStatus::Completed);
        assert_eq!(view.metadata.unwrap().title.as_deref(), Some("t"));
    }

    /// A [Backend] that always reports the short code taken at insert
    struct AlwaysTaken;

    #[async_trait]
    impl StorageBackend for AlwaysTaken {
        async fn insert_link(&self, _: &LinkRecord) -> std::result::Result<bool, StorageError> {
            Ok(false)
        }
        async fn get_link(
            &self,
            _: &ArtifactId,
        ) -> std::result::Result<Option<LinkRecord>, StorageError> {
            Ok(None)
        }
        async fn short_code_exists(
            &self,
            _: &ShortCode,
        ) -> std::result::Result<bool, StorageError> {
            Ok(false)
        }
        async fn set_metadata_status(
            &self,
            _: &ArtifactId,
            _: MetadataStatus,
        ) -> std::result::Result<(), StorageError> {
            Ok(())
        }
        async fn apply_metadata(
            &self,
            _: &ArtifactId,
            _: &PageMetadata,
        ) -> std::result::Result<(), StorageError> {
            Ok(())
        }
        async fn search(
            &self,
            _: &str,
            _: usize,
            _: usize,
        ) -> std::result::Result<(Vec<LinkRecord>, usize), StorageError> {
            Ok((vec![], 0))
        }
    }

    #[tokio::test]
    async fn insert_races_are_bounded() {
        let (service, _queue) = service_over(Arc::new(AlwaysTaken));
        match service.submit_one(submission("https://example.com"), IP).await {
            Err(Error::Duplicate { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected Duplicate, got {:?}", other.map(|r| r.id())),
        }
    }
}
