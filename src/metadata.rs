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

//! # Open Graph metadata resolution
//!
//! Given a link target, produce a best-effort `{title, description, thumbnail}` triple by
//! querying an ordered list of resolution services. The services speak heterogeneous shapes
//! (a JSON envelope, flat JSON, or the target page's raw HTML), so each provider is paired with
//! a typed parser *at configuration time*; nothing in the request path inspects endpoint strings
//! to decide how to read a body.
//!
//! The resolver is deliberately infallible at its boundary: provider-level failures (timeouts,
//! non-2xx statuses, malformed bodies) are logged & drive fallback to the next provider, and
//! exhausting the list yields an all-empty [PageMetadata], not an error. Whether "no data" is a
//! problem is the caller's concern, not ours.

use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;
use reqwest::{
    header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, USER_AGENT},
    StatusCode,
};
use snafu::{prelude::*, Backtrace};
use tap::Pipe;
use tracing::debug;
use url::Url;

use crate::entities::PageMetadata;

/// Hard per-provider timeout; the only cancellation mechanism in the enrichment path
pub const PROVIDER_TIMEOUT: Duration = Duration::from_secs(15);

/// Construction-time errors; [Resolver::resolve] itself never fails
#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to build the resolver's HTTP client: {source}"))]
    Client {
        source: reqwest::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Per-attempt failure modes, internal to this module by design
#[derive(Debug, Snafu)]
enum AttemptError {
    #[snafu(display("Failed to read the response body: {source}"))]
    Body { source: reqwest::Error },
    #[snafu(display("Request failed: {source}"))]
    Request { source: reqwest::Error },
    #[snafu(display("Provider answered {status}"))]
    Status { status: StatusCode },
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        response parsing                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The known provider response shapes
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Shape {
    /// title/description/image nested under a `data` key
    JsonEnvelope,
    /// top-level `title`/`description`/`image`
    JsonFlat,
    /// The target page itself; scan for Open Graph meta tags
    Html,
}

type ParseFn = fn(&str, &Url) -> PageMetadata;

impl Shape {
    /// The typed parser for this shape; looked-up once, when the provider table is built
    pub fn parser(self) -> ParseFn {
        match self {
            Shape::JsonEnvelope => parse_json_envelope,
            Shape::JsonFlat => parse_json_flat,
            Shape::Html => parse_html,
        }
    }
}

fn non_blank(s: Option<&str>) -> Option<String> {
    s.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

/// Pull a string out of `v[field]`, tolerating the `{"url": "..."}` sub-object some services use
/// for images
fn json_string_field(v: &serde_json::Value, field: &str) -> Option<String> {
    non_blank(v[field].as_str()).or_else(|| non_blank(v[field]["url"].as_str()))
}

fn parse_json_envelope(body: &str, _target: &Url) -> PageMetadata {
    let v: serde_json::Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(_) => return PageMetadata::default(),
    };
    let data = &v["data"];
    PageMetadata {
        title: json_string_field(data, "title"),
        description: json_string_field(data, "description"),
        thumbnail: json_string_field(data, "image"),
    }
}

fn parse_json_flat(body: &str, _target: &Url) -> PageMetadata {
    let v: serde_json::Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(_) => return PageMetadata::default(),
    };
    PageMetadata {
        title: json_string_field(&v, "title"),
        description: json_string_field(&v, "description"),
        thumbnail: json_string_field(&v, "image"),
    }
}

lazy_static! {
    static ref META_TAG: Regex = Regex::new(r"(?i)<meta\b[^>]*>").unwrap(/* known good */);
    static ref META_ATTR: Regex =
        Regex::new(r#"(?i)([a-z-]+)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).unwrap(/* known good */);
    static ref TITLE_TAG: Regex = Regex::new(r"(?is)<title[^>]*>(.*?)</title>").unwrap(/* known good */);
}

/// Find the `content` attribute of the first meta tag whose `property` (or `name`) attribute is
/// `key`. This is pattern-matching, not HTML parsing; good enough for the tags we're after, and
/// it keeps a full DOM out of the dependency tree.
fn meta_content(html: &str, key: &str) -> Option<String> {
    for tag in META_TAG.find_iter(html) {
        let mut matched = false;
        let mut content: Option<String> = None;
        for caps in META_ATTR.captures_iter(tag.as_str()) {
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .map(|m| m.as_str())
                .unwrap_or("");
            match caps[1].to_ascii_lowercase().as_str() {
                "property" | "name" if value.eq_ignore_ascii_case(key) => matched = true,
                "content" => content = non_blank(Some(value)),
                _ => (),
            }
        }
        if matched && content.is_some() {
            return content;
        }
    }
    None
}

/// Make an image reference absolute, resolving relative paths against the page that referenced it
fn absolutize(image: String, target: &Url) -> Option<String> {
    target.join(&image).ok().map(|u| u.to_string())
}

fn parse_html(body: &str, target: &Url) -> PageMetadata {
    let title = meta_content(body, "og:title").or_else(|| {
        TITLE_TAG
            .captures(body)
            .and_then(|caps| non_blank(Some(&caps[1])))
    });
    let description =
        meta_content(body, "og:description").or_else(|| meta_content(body, "description"));
    let thumbnail = meta_content(body, "og:image").and_then(|img| absolutize(img, target));
    PageMetadata {
        title,
        description,
        thumbnail,
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Provider                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Where a provider's response comes from
#[derive(Clone, Debug)]
pub enum Target {
    /// An URL-prefix to which the percent-encoded link target is appended
    Prefixed(String),
    /// Fetch the link target itself (the generic HTML fallback)
    Direct,
}

/// One entry in the resolver's fallback chain
pub struct Provider {
    name: String,
    target: Target,
    parse: ParseFn,
}

impl Provider {
    pub fn new(name: &str, target: Target, shape: Shape) -> Provider {
        Provider {
            name: name.to_owned(),
            target,
            parse: shape.parser(),
        }
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    fn request_url(&self, link: &Url) -> String {
        match &self.target {
            Target::Prefixed(prefix) => {
                format!("{}{}", prefix, urlencoding::encode(link.as_str()))
            }
            Target::Direct => link.to_string(),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Resolver                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

fn identification_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_static("Mozilla/5.0 (compatible; shortstash/0.1; +sp1ff@pobox.com)"),
    );
    headers.insert(
        ACCEPT,
        HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/json;q=0.9,*/*;q=0.8",
        ),
    );
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.5"));
    headers
}

pub struct Resolver {
    client: reqwest::Client,
    providers: Vec<Provider>,
}

impl Resolver {
    /// Build a [Resolver] with the standard provider chain: the operator-configured endpoint
    /// first, if any (assumed to speak the JSON envelope shape), then the built-in fallbacks,
    /// ending with a direct fetch of the page itself.
    pub fn new(custom_endpoint: Option<String>) -> Result<Resolver> {
        let mut providers = Vec::new();
        if let Some(endpoint) = custom_endpoint {
            providers.push(Provider::new(
                "custom",
                Target::Prefixed(endpoint),
                Shape::JsonEnvelope,
            ));
        }
        providers.push(Provider::new(
            "microlink",
            Target::Prefixed("https://api.microlink.io/?url=".to_owned()),
            Shape::JsonEnvelope,
        ));
        providers.push(Provider::new(
            "jsonlink",
            Target::Prefixed("https://jsonlink.io/api/extract?url=".to_owned()),
            Shape::JsonFlat,
        ));
        providers.push(Provider::new("page", Target::Direct, Shape::Html));
        Resolver::with_providers(providers)
    }
    /// Build a [Resolver] over an arbitrary provider chain
    pub fn with_providers(providers: Vec<Provider>) -> Result<Resolver> {
        let client = reqwest::Client::builder()
            .timeout(PROVIDER_TIMEOUT)
            .default_headers(identification_headers())
            .build()
            .context(ClientSnafu)?;
        Ok(Resolver { client, providers })
    }
    /// Resolve `link` to its best-effort metadata triple
    ///
    /// Providers are attempted strictly in order; the first whose parsed response carries at
    /// least one non-empty field wins. This method never fails-- if every provider errors or
    /// comes up empty, the result is simply empty.
    pub async fn resolve(&self, link: &Url) -> PageMetadata {
        for provider in &self.providers {
            match self.attempt(provider, link).await {
                Ok(metadata) if !metadata.is_empty() => {
                    debug!("Provider {} resolved {}", provider.name(), link);
                    return metadata;
                }
                Ok(_) => {
                    debug!("Provider {} had no data for {}", provider.name(), link);
                }
                Err(err) => {
                    debug!("Provider {} failed for {}: {}", provider.name(), link, err);
                }
            }
        }
        PageMetadata::default()
    }
    async fn attempt(
        &self,
        provider: &Provider,
        link: &Url,
    ) -> std::result::Result<PageMetadata, AttemptError> {
        let rsp = self
            .client
            .get(provider.request_url(link))
            .send()
            .await
            .context(RequestSnafu)?;
        let status = rsp.status();
        ensure!(status.is_success(), StatusSnafu { status });
        let body = rsp.text().await.context(BodySnafu)?;
        (provider.parse)(&body, link).pipe(Ok)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    #[test]
    fn json_envelope() {
        let body = r#"{"status":"success","data":{"title":"A Title","description":"About things","image":{"url":"https://cdn.example.com/a.png"}}}"#;
        let target = Url::parse("https://example.com").unwrap();
        assert_eq!(
            parse_json_envelope(body, &target),
            PageMetadata {
                title: Some("A Title".to_owned()),
                description: Some("About things".to_owned()),
                thumbnail: Some("https://cdn.example.com/a.png".to_owned()),
            }
        );
        assert!(parse_json_envelope("not json", &target).is_empty());
    }

    #[test]
    fn json_flat() {
        let body = r#"{"title":"Flat","description":"","image":"https://cdn.example.com/b.png"}"#;
        let target = Url::parse("https://example.com").unwrap();
        let metadata = parse_json_flat(body, &target);
        assert_eq!(metadata.title.as_deref(), Some("Flat"));
        // blank strings are absent, not empty
        assert_eq!(metadata.description, None);
        assert_eq!(
            metadata.thumbnail.as_deref(),
            Some("https://cdn.example.com/b.png")
        );
    }

    #[test]
    fn html_open_graph() {
        let body = r#"<html><head>
            <meta property="og:title" content="OG Title"/>
            <meta content='OG Description' property='og:description'>
            <meta property="og:image" content="https://example.com/img/c.png">
            <title>Fallback Title</title>
            </head><body></body></html>"#;
        let target = Url::parse("https://example.com/post/1").unwrap();
        let metadata = parse_html(body, &target);
        assert_eq!(metadata.title.as_deref(), Some("OG Title"));
        assert_eq!(metadata.description.as_deref(), Some("OG Description"));
        assert_eq!(
            metadata.thumbnail.as_deref(),
            Some("https://example.com/img/c.png")
        );
    }

    #[test]
    fn html_fallback_tags() {
        let body = r#"<html><head>
            <title> Plain Title </title>
            <meta name="description" content="plain description">
            </head></html>"#;
        let target = Url::parse("https://example.com").unwrap();
        let metadata = parse_html(body, &target);
        assert_eq!(metadata.title.as_deref(), Some("Plain Title"));
        assert_eq!(metadata.description.as_deref(), Some("plain description"));
        assert_eq!(metadata.thumbnail, None);
    }

    #[test]
    fn relative_thumbnails_resolve_against_the_target() {
        let body = r#"<meta property="og:image" content="/img/a.png">"#;
        let target = Url::parse("https://example.com/post/1").unwrap();
        let metadata = parse_html(body, &target);
        assert_eq!(
            metadata.thumbnail.as_deref(),
            Some("https://example.com/img/a.png")
        );
    }

    fn prefixed(name: &str, server: &MockServer, route: &str, shape: Shape) -> Provider {
        Provider::new(
            name,
            Target::Prefixed(format!("{}{}?url=", server.uri(), route)),
            shape,
        )
    }

    #[tokio::test]
    async fn fallback_chain() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/b"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/c"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"title":"Third Time Lucky","description":"d","image":null}"#),
            )
            .mount(&server)
            .await;

        let resolver = Resolver::with_providers(vec![
            prefixed("a", &server, "/a", Shape::JsonEnvelope),
            prefixed("b", &server, "/b", Shape::JsonFlat),
            prefixed("c", &server, "/c", Shape::JsonFlat),
        ])
        .unwrap();

        let metadata = resolver
            .resolve(&Url::parse("https://example.com").unwrap())
            .await;
        assert_eq!(metadata.title.as_deref(), Some("Third Time Lucky"));
    }

    #[tokio::test]
    async fn exhaustion_yields_empty_not_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let resolver = Resolver::with_providers(vec![
            prefixed("a", &server, "/a", Shape::JsonEnvelope),
            prefixed("b", &server, "/b", Shape::JsonFlat),
        ])
        .unwrap();

        let metadata = resolver
            .resolve(&Url::parse("https://example.com").unwrap())
            .await;
        assert!(metadata.is_empty());
    }

    #[tokio::test]
    async fn empty_results_drive_fallback() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/empty"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/full"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(r#"{"title":"From B"}"#),
            )
            .mount(&server)
            .await;

        let resolver = Resolver::with_providers(vec![
            prefixed("empty", &server, "/empty", Shape::JsonFlat),
            prefixed("full", &server, "/full", Shape::JsonFlat),
        ])
        .unwrap();

        let metadata = resolver
            .resolve(&Url::parse("https://example.com").unwrap())
            .await;
        assert_eq!(metadata.title.as_deref(), Some("From B"));
    }
}
