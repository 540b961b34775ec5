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

//! # The shortstash HTTP surface
//!
//! JSON in, JSON out:
//!
//! - `POST /v1/links`: submit one link; responds 201 with the stored record (status `PENDING`)
//! - `POST /v1/links/batch`: submit several; per-item failures ride in the response body
//! - `POST /v1/links/{id}/retry`: re-dispatch enrichment; responds 202
//! - `GET /v1/links/{id}/status`: poll a record's enrichment state
//! - `GET /v1/links/search?q=...&page=...&limit=...`
//!
//! Handlers follow a common shape: an inner function does the work & returns a `Result`, the
//! outer handler translates that into a response, so that `?` is available where the logic
//! lives.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tower_http::{cors::CorsLayer, set_header::SetResponseHeaderLayer};
use tracing::{error, info};

use crate::{
    entities::{ArtifactId, LifecycleStatus, LinkRecord, MetadataStatus, PageMetadata},
    ingestion::{self, Submission},
    shortstash::Shortstash,
};

/// A serializable struct for use in HTTP error responses
///
/// This is intended to be used in the [IntoResponse] implementations for whatever error type an
/// axum handler is using; it at least sets-up a standard representation of an error response.
///
/// [IntoResponse]: https://docs.rs/axum/latest/axum/response/trait.IntoResponse.html
#[derive(Debug, Deserialize, Serialize)]
pub struct ErrorResponseBody {
    pub error: String,
}

impl axum::response::IntoResponse for ErrorResponseBody {
    fn into_response(self) -> axum::response::Response {
        Json(self).into_response()
    }
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{text} is not a valid record id: {source}"))]
    BadId { text: String, source: uuid::Error },
    #[snafu(display("{source}"))]
    Ingestion { source: ingestion::Error },
}

impl Error {
    pub fn as_status_and_msg(&self) -> (StatusCode, String) {
        match self {
            ////////////////////////////////////////////////////////////////////////////////////////
            // Broken requests-- tell the caller how to fix it
            ////////////////////////////////////////////////////////////////////////////////////////
            Error::BadId { text, source, .. } => (
                StatusCode::BAD_REQUEST,
                format!("{} is not a valid record id: {}", text, source),
            ),
            Error::Ingestion {
                source: ingestion::Error::Invalid { source },
            } => (StatusCode::BAD_REQUEST, format!("{source}")),
            ////////////////////////////////////////////////////////////////////////////////////////
            // Missing resources
            ////////////////////////////////////////////////////////////////////////////////////////
            Error::Ingestion {
                source: ingestion::Error::NotFound { id },
            } => (StatusCode::NOT_FOUND, format!("No record with id {id}")),
            ////////////////////////////////////////////////////////////////////////////////////////
            // Internal failure-- own up to it:
            ////////////////////////////////////////////////////////////////////////////////////////
            Error::Ingestion { source } => {
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{source}"))
            }
        }
    }
}

// Not sure about this approach-- the implementation of this trait is awfully prolix. OTOH, it does
// make the implementation of handlers much easier...
impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let (code, msg) = self.as_status_and_msg();
        (code, Json(ErrorResponseBody { error: msg })).into_response()
    }
}

type Result<T> = std::result::Result<T, Error>;

fn parse_id(text: &str) -> Result<ArtifactId> {
    ArtifactId::from_raw_string(text).context(BadIdSnafu { text })
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        wire-level types                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Deserialize)]
struct SubmitReq {
    url: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    thumbnail: Option<String>,
    #[serde(default)]
    categories: Vec<String>,
    #[serde(default)]
    tags: Vec<String>,
}

impl From<SubmitReq> for Submission {
    fn from(req: SubmitReq) -> Submission {
        Submission {
            url: req.url,
            title: req.title,
            description: req.description,
            thumbnail: req.thumbnail,
            categories: req.categories,
            tags: req.tags,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
struct BatchReq {
    links: Vec<SubmitReq>,
    /// Concatenated onto every item's own categories
    #[serde(default)]
    categories: Vec<String>,
    /// Concatenated onto every item's own tags
    #[serde(default)]
    tags: Vec<String>,
}

/// A [LinkRecord] as presented on the wire
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkRsp {
    pub id: ArtifactId,
    pub short_code: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    pub metadata_status: MetadataStatus,
    pub status: LifecycleStatus,
    pub categories: Vec<String>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&LinkRecord> for LinkRsp {
    fn from(record: &LinkRecord) -> LinkRsp {
        LinkRsp {
            id: record.id(),
            short_code: record.short_code().as_ref().to_owned(),
            url: record.url().as_ref().to_owned(),
            title: record.title().map(str::to_owned),
            description: record.description().map(str::to_owned),
            thumbnail: record.thumbnail().map(str::to_owned),
            metadata_status: record.metadata_status(),
            status: record.status(),
            categories: record
                .categories()
                .iter()
                .map(|c| c.as_ref().to_owned())
                .collect(),
            tags: record.tags().iter().map(|t| t.as_ref().to_owned()).collect(),
            created_at: record.created_at(),
            updated_at: record.updated_at(),
        }
    }
}

#[derive(Debug, Serialize)]
struct BatchErrorRsp {
    url: String,
    error: String,
}

#[derive(Debug, Serialize)]
struct BatchRsp {
    success: bool,
    files: Vec<LinkRsp>,
    errors: Vec<BatchErrorRsp>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusRsp {
    status: MetadataStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<PageMetadata>,
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    q: String,
    #[serde(default = "default_page")]
    page: usize,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_page() -> usize {
    1
}

fn default_limit() -> usize {
    20
}

#[derive(Debug, Serialize)]
struct SearchRsp {
    records: Vec<LinkRsp>,
    total: usize,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            handlers                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Submit a single link
async fn submit(
    State(state): State<Arc<Shortstash>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<SubmitReq>,
) -> axum::response::Response {
    async fn submit1(state: &Shortstash, req: SubmitReq, addr: SocketAddr) -> Result<LinkRsp> {
        let record = state
            .service
            .submit_one(req.into(), addr.ip())
            .await
            .context(IngestionSnafu)?;
        Ok(LinkRsp::from(&record))
    }

    match submit1(&state, req, addr).await {
        Ok(rsp) => {
            info!("Catalogued {} as {}", rsp.url, rsp.short_code);
            (StatusCode::CREATED, Json(rsp)).into_response()
        }
        Err(err) => {
            error!("{:#?}", err);
            err.into_response()
        }
    }
}

/// Submit several links in one request
async fn submit_batch(
    State(state): State<Arc<Shortstash>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<BatchReq>,
) -> axum::response::Response {
    async fn submit_batch1(
        state: &Shortstash,
        req: BatchReq,
        addr: SocketAddr,
    ) -> Result<BatchRsp> {
        let outcome = state
            .service
            .submit_batch(
                req.links.into_iter().map(Submission::from).collect(),
                req.categories,
                req.tags,
                addr.ip(),
            )
            .await
            .context(IngestionSnafu)?;
        Ok(BatchRsp {
            success: outcome.success,
            files: outcome.files.iter().map(LinkRsp::from).collect(),
            errors: outcome
                .errors
                .into_iter()
                .map(|e| BatchErrorRsp {
                    url: e.url,
                    error: e.message,
                })
                .collect(),
        })
    }

    match submit_batch1(&state, req, addr).await {
        // 201 even with per-item failures; the body's `success` flag tells the story
        Ok(rsp) => (StatusCode::CREATED, Json(rsp)).into_response(),
        Err(err) => {
            error!("{:#?}", err);
            err.into_response()
        }
    }
}

/// Re-dispatch enrichment for an existing record
async fn retry(
    State(state): State<Arc<Shortstash>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    async fn retry1(state: &Shortstash, id: &str) -> Result<()> {
        let id = parse_id(id)?;
        state.service.retry(&id).await.context(IngestionSnafu)
    }

    match retry1(&state, &id).await {
        Ok(_) => StatusCode::ACCEPTED.into_response(),
        Err(err) => {
            error!("{:#?}", err);
            err.into_response()
        }
    }
}

/// Poll a record's enrichment status
async fn status(
    State(state): State<Arc<Shortstash>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    async fn status1(state: &Shortstash, id: &str) -> Result<StatusRsp> {
        let id = parse_id(id)?;
        let view = state.service.get_status(&id).await.context(IngestionSnafu)?;
        Ok(StatusRsp {
            status: view.status,
            metadata: view.metadata,
        })
    }

    match status1(&state, &id).await {
        Ok(rsp) => (StatusCode::OK, Json(rsp)).into_response(),
        Err(err) => {
            error!("{:#?}", err);
            err.into_response()
        }
    }
}

/// Search the catalog
async fn search(
    State(state): State<Arc<Shortstash>>,
    Query(params): Query<SearchParams>,
) -> axum::response::Response {
    async fn search1(state: &Shortstash, params: &SearchParams) -> Result<SearchRsp> {
        let (records, total) = state
            .service
            .search(&params.q, params.page, params.limit)
            .await
            .context(IngestionSnafu)?;
        Ok(SearchRsp {
            records: records.iter().map(LinkRsp::from).collect(),
            total,
        })
    }

    match search1(&state, &params).await {
        Ok(rsp) => (StatusCode::OK, Json(rsp)).into_response(),
        Err(err) => {
            error!("{:#?}", err);
            err.into_response()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Public API                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Return a router for the link API
pub fn make_router(state: Arc<Shortstash>) -> Router {
    Router::new()
        .route("/v1/links", post(submit))
        .route("/v1/links/batch", post(submit_batch))
        .route("/v1/links/{id}/retry", post(retry))
        .route("/v1/links/{id}/status", get(status))
        .route("/v1/links/search", get(search))
        // All responses are JSON; add the appropriate Content-Type header (but leave the existing
        // Content-Type header should a handler set it specially).
        .layer(SetResponseHeaderLayer::if_not_present(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
