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

//! # The enrichment task
//!
//! [EnrichLink] is the background task that carries a link record from `PENDING` through
//! `PROCESSING` to a terminal state. By the time it runs, the submission call has long since
//! returned, so nothing here can reach the submitter: failures are recorded as a `FAILED` status
//! transition & a log line, full stop.
//!
//! Note the asymmetry in what counts as failure. A resolution that turns up *nothing* still
//! completes-- "the pipeline ran" and "the pipeline found data" are different claims, and pollers
//! distinguish them by looking at the fields, not the status. `FAILED` is reserved for the
//! unexpected: a storage write refused mid-pipeline.
//!
//! A task claims its record by advancing it to `PROCESSING` before doing anything else. If the
//! claim is refused (another task is mid-flight, or the record already completed or vanished),
//! the task steps aside without touching the record-- in particular it does *not* brand it
//! `FAILED`.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use snafu::prelude::*;
use tracing::{debug, error, warn};

use crate::{
    background::{self, Task},
    entities::{ArtifactId, LinkUrl, MetadataStatus},
    metadata::Resolver,
    storage::{self, Backend as StorageBackend},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Storage failure during enrichment: {source}"))]
    Storage { source: storage::Error },
}

type Result<T> = std::result::Result<T, Error>;

/// Everything an [EnrichLink] task needs at execution time; one instance is built at startup &
/// cloned per task
#[derive(Clone)]
pub struct Context {
    pub storage: Arc<dyn StorageBackend + Send + Sync>,
    pub resolver: Arc<Resolver>,
}

/// Resolve one link's Open Graph metadata & fold it into the stored record
pub struct EnrichLink {
    id: ArtifactId,
    url: LinkUrl,
}

impl EnrichLink {
    pub fn new(id: ArtifactId, url: LinkUrl) -> EnrichLink {
        EnrichLink { id, url }
    }
    /// The pipeline proper; the record has already been advanced to `PROCESSING`
    async fn run(&self, context: &Context) -> Result<()> {
        // Infallible; an empty triple just means no provider had anything for us
        let metadata = context.resolver.resolve(self.url.as_url()).await;
        if metadata.is_empty() {
            debug!("No metadata found for {}", self.url.as_ref());
        }
        context
            .storage
            .apply_metadata(&self.id, &metadata)
            .await
            .context(StorageSnafu)?;
        context
            .storage
            .set_metadata_status(&self.id, MetadataStatus::Completed)
            .await
            .context(StorageSnafu)
    }
}

#[async_trait]
impl Task<Context> for EnrichLink {
    /// Run the enrichment pipeline; always returns Ok
    ///
    /// The submitter has already gotten their response, so an error here has nowhere to go except
    /// the record's status & the log.
    async fn exec(self: Box<Self>, context: Context) -> background::Result<()> {
        // Claim the record. A refusal means it isn't ours to touch: already in-flight under
        // another task, already completed, or gone.
        if let Err(err) = context
            .storage
            .set_metadata_status(&self.id, MetadataStatus::Processing)
            .await
        {
            warn!("Skipping enrichment of {}: {}", self.id, err);
            return Ok(());
        }
        if let Err(err) = self.run(&context).await {
            warn!("Enrichment of {} failed: {}", self.id, err);
            if let Err(err) = context
                .storage
                .set_metadata_status(&self.id, MetadataStatus::Failed)
                .await
            {
                // Best-effort; the record may be gone
                error!("Failed to mark {} as FAILED: {}", self.id, err);
            }
        }
        Ok(())
    }
    fn timeout(&self) -> Option<Duration> {
        // Comfortably above the worst-case provider chain (each provider is itself bounded by
        // PROVIDER_TIMEOUT)
        Some(Duration::from_secs(90))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::{
        entities::{CategoryName, LinkRecord, PageMetadata, ShortCode, Tagname},
        memory::MemoryBackend,
        metadata::{Provider, Shape, Target},
    };

    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    fn record(overrides: PageMetadata, url: &str) -> LinkRecord {
        LinkRecord::new(
            ShortCode::new("ABC123").unwrap(),
            LinkUrl::new(url).unwrap(),
            overrides,
            vec![CategoryName::new("misc").unwrap()],
            Vec::<Tagname>::new(),
            "127.0.0.1".parse().unwrap(),
        )
        .unwrap()
    }

    async fn context_against(server: &MockServer) -> (Context, Arc<MemoryBackend>) {
        let storage = Arc::new(MemoryBackend::new());
        let resolver = Resolver::with_providers(vec![Provider::new(
            "test",
            Target::Prefixed(format!("{}/resolve?url=", server.uri())),
            Shape::JsonFlat,
        )])
        .unwrap();
        (
            Context {
                storage: storage.clone() as Arc<dyn StorageBackend + Send + Sync>,
                resolver: Arc::new(resolver),
            },
            storage,
        )
    }

    #[tokio::test]
    async fn successful_enrichment_completes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/resolve"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"title":"Resolved","description":"words","image":"https://cdn.example.com/t.png"}"#,
            ))
            .mount(&server)
            .await;
        let (context, storage) = context_against(&server).await;

        let rec = record(PageMetadata::default(), "https://example.com/post");
        let id = rec.id();
        storage.insert_link(&rec).await.unwrap();

        let task = Box::new(EnrichLink::new(id, rec.url().clone()));
        task.exec(context).await.unwrap();

        let seen = storage.get_link(&id).await.unwrap().unwrap();
        assert_eq!(seen.metadata_status(), MetadataStatus::Completed);
        assert_eq!(seen.title(), Some("Resolved"));
        assert_eq!(seen.description(), Some("words"));
    }

    #[tokio::test]
    async fn caller_overrides_survive_enrichment() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/resolve"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"title":"Resolved","description":"resolved"}"#),
            )
            .mount(&server)
            .await;
        let (context, storage) = context_against(&server).await;

        let rec = record(
            PageMetadata {
                title: Some("Mine".to_owned()),
                ..Default::default()
            },
            "https://example.com/post",
        );
        let id = rec.id();
        storage.insert_link(&rec).await.unwrap();

        Box::new(EnrichLink::new(id, rec.url().clone()))
            .exec(context)
            .await
            .unwrap();

        let seen = storage.get_link(&id).await.unwrap().unwrap();
        assert_eq!(seen.title(), Some("Mine"));
        assert_eq!(seen.description(), Some("resolved"));
    }

    #[tokio::test]
    async fn empty_resolution_still_completes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let (context, storage) = context_against(&server).await;

        let rec = record(PageMetadata::default(), "https://example.com/post");
        let id = rec.id();
        storage.insert_link(&rec).await.unwrap();

        Box::new(EnrichLink::new(id, rec.url().clone()))
            .exec(context)
            .await
            .unwrap();

        let seen = storage.get_link(&id).await.unwrap().unwrap();
        assert_eq!(seen.metadata_status(), MetadataStatus::Completed);
        assert_eq!(seen.title(), None);
        assert_eq!(seen.description(), None);
        assert_eq!(seen.thumbnail(), None);
    }

    #[tokio::test]
    async fn in_flight_records_are_left_alone() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/resolve"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(r#"{"title":"Late arrival"}"#),
            )
            .mount(&server)
            .await;
        let (context, storage) = context_against(&server).await;

        let rec = record(PageMetadata::default(), "https://example.com/post");
        let id = rec.id();
        storage.insert_link(&rec).await.unwrap();
        // Another task has this record mid-flight
        storage
            .set_metadata_status(&id, MetadataStatus::Processing)
            .await
            .unwrap();

        // A duplicate dispatch (say, a caller retrying a record that isn't FAILED) can't claim
        // the record; it must step aside, not drive it to FAILED.
        Box::new(EnrichLink::new(id, rec.url().clone()))
            .exec(context)
            .await
            .unwrap();

        let seen = storage.get_link(&id).await.unwrap().unwrap();
        assert_eq!(seen.metadata_status(), MetadataStatus::Processing);
        assert_eq!(seen.title(), None);
    }

    #[tokio::test]
    async fn unknown_record_marks_nothing_but_returns_ok() {
        let server = MockServer::start().await;
        let (context, _storage) = context_against(&server).await;
        // No record inserted; the first status write fails, and exec still returns Ok
        let task = Box::new(EnrichLink::new(
            ArtifactId::new(),
            LinkUrl::new("https://example.com").unwrap(),
        ));
        assert!(task.exec(context).await.is_ok());
    }
}
