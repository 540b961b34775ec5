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

//! # shortstash models
//!
//! I hate these sort of "catch-all" modules named "models" or "entities", but these types are truly
//! foundational: the refined types out of which link records are built, and the record itself.

use std::{fmt::Display, net::IpAddr, ops::Deref, str::FromStr};

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use snafu::{prelude::*, Backtrace};
use unicode_segmentation::UnicodeSegmentation;
use url::Url;
use uuid::Uuid;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{text} is not a valid category name"))]
    BadCategory { text: String, backtrace: Backtrace },
    #[snafu(display("{text} is not a valid short code"))]
    BadShortCode { text: String, backtrace: Backtrace },
    #[snafu(display("{text} is not a valid tag name"))]
    BadTagname { text: String, backtrace: Backtrace },
    #[snafu(display("Illegal metadata status transition {from} -> {to}"))]
    BadTransition {
        from: MetadataStatus,
        to: MetadataStatus,
        backtrace: Backtrace,
    },
    #[snafu(display("Links require at least one category"))]
    NoCategories { backtrace: Backtrace },
    #[snafu(display("{url} does not use the http or https scheme"))]
    Scheme { url: String, backtrace: Backtrace },
    #[snafu(display("Failed to parse {text} as an URL: {source}"))]
    UrlParse {
        text: String,
        source: url::ParseError,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

fn mk_serde_de_err<'de, D: serde::Deserializer<'de>>(err: impl std::error::Error) -> D::Error {
    <D::Error as serde::de::Error>::custom(format!("{:?}", err))
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           ArtifactId                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Opaque identifier for a catalogued artifact
///
/// In a document-store world we can't count on an auto-increment column to serve as an opaque
/// identifier; the application assigns its own. Like everyone else, I trade space for ease of
/// implementation & just use a UUID, wrapped in a newtype so that an artifact id can't be confused
/// with any other sort of identifier.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ArtifactId(Uuid);

impl ArtifactId {
    pub fn new() -> ArtifactId {
        ArtifactId(Uuid::new_v4())
    }
    pub fn from_raw_string(s: &str) -> StdResult<ArtifactId, uuid::Error> {
        Ok(ArtifactId(Uuid::parse_str(s)?))
    }
}

impl Default for ArtifactId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ArtifactId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.as_hyphenated())
    }
}

impl From<Uuid> for ArtifactId {
    fn from(value: Uuid) -> Self {
        ArtifactId(value)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            ShortCode                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

// Short codes are six characters, uppercase alphanumeric. Note that this check is deliberately
// looser than the generation alphabet (which omits `O` & `0`): codes minted before the ambiguous
// characters were dropped must remain addressable.
lazy_static! {
    static ref SHORT_CODE: Regex = Regex::new("^[A-Z0-9]{6}$").unwrap(/* known good */);
}

fn check_short_code(s: &str) -> bool {
    SHORT_CODE.is_match(s)
}

/// A refined type representing a shortstash short code
// Boy... writing refined types in Rust involves a *lot* of boilerplate. I have to wonder if there
// isn't a better way...
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct ShortCode(String);

impl ShortCode {
    /// Construct a [ShortCode] from a `&str`, copying. To *move* a [String] into a [ShortCode]
    /// (with validity checking) use [TryFrom::try_from()].
    pub fn new(text: &str) -> Result<ShortCode> {
        check_short_code(text)
            .then_some(ShortCode(text.to_owned()))
            .ok_or(
                BadShortCodeSnafu {
                    text: text.to_owned(),
                }
                .build(),
            )
    }
}

impl AsRef<str> for ShortCode {
    fn as_ref(&self) -> &str {
        self.deref()
    }
}

impl Deref for ShortCode {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// Implement `Deserialize` by hand to fail if the serialized value isn't a legit `ShortCode`
impl<'de> Deserialize<'de> for ShortCode {
    fn deserialize<D>(deserializer: D) -> StdResult<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        ShortCode::try_from(s).map_err(mk_serde_de_err::<'de, D>)
    }
}

impl Display for ShortCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ShortCode {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ShortCode::new(s)
    }
}

impl TryFrom<String> for ShortCode {
    type Error = Error;

    fn try_from(text: String) -> std::result::Result<Self, Self::Error> {
        if check_short_code(&text) {
            Ok(ShortCode(text))
        } else {
            BadShortCodeSnafu { text }.fail()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             LinkUrl                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

fn check_scheme(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https")
}

/// A link target: an URL restricted to the `http` & `https` schemes
///
/// Validation happens once, at submission time; thereafter the rest of the system can rely on the
/// scheme being sane (in particular, the metadata resolver will happily append whatever it's
/// handed to a provider endpoint).
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(transparent)]
pub struct LinkUrl(Url);

impl LinkUrl {
    pub fn new(text: &str) -> Result<LinkUrl> {
        let url = Url::parse(text).context(UrlParseSnafu { text })?;
        check_scheme(&url).then_some(LinkUrl(url)).ok_or(
            SchemeSnafu {
                url: text.to_owned(),
            }
            .build(),
        )
    }
    pub fn as_url(&self) -> &Url {
        &self.0
    }
}

impl AsRef<str> for LinkUrl {
    fn as_ref(&self) -> &str {
        self.0.as_str()
    }
}

// Implement `Deserialize` by hand to fail if the serialized value isn't a legit `LinkUrl`
impl<'de> Deserialize<'de> for LinkUrl {
    fn deserialize<D>(deserializer: D) -> StdResult<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        LinkUrl::new(&s).map_err(mk_serde_de_err::<'de, D>)
    }
}

impl Display for LinkUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LinkUrl {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        LinkUrl::new(s)
    }
}

impl From<LinkUrl> for Url {
    fn from(value: LinkUrl) -> Self {
        value.0
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          CategoryName                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

const MAX_CATEGORY_LENGTH: usize = 100;

fn check_category(s: &str) -> bool {
    !s.trim().is_empty() && UnicodeSegmentation::graphemes(s, true).count() <= MAX_CATEGORY_LENGTH
}

/// A caller-supplied category under which an artifact is filed
///
/// Categories are free-form, but must be non-blank & no more than 100 graphemes.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct CategoryName(String);

impl CategoryName {
    pub fn new(text: &str) -> Result<CategoryName> {
        check_category(text)
            .then_some(CategoryName(text.to_owned()))
            .ok_or(
                BadCategorySnafu {
                    text: text.to_owned(),
                }
                .build(),
            )
    }
}

impl AsRef<str> for CategoryName {
    fn as_ref(&self) -> &str {
        self.deref()
    }
}

impl Deref for CategoryName {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'de> Deserialize<'de> for CategoryName {
    fn deserialize<D>(deserializer: D) -> StdResult<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        CategoryName::try_from(s).map_err(mk_serde_de_err::<'de, D>)
    }
}

impl Display for CategoryName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for CategoryName {
    type Error = Error;

    fn try_from(text: String) -> std::result::Result<Self, Self::Error> {
        if check_category(&text) {
            Ok(CategoryName(text))
        } else {
            BadCategorySnafu { text }.fail()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             Tagname                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

const MAX_TAGNAME_LENGTH: usize = 255;

fn check_tagname(s: &str) -> bool {
    !s.is_empty()
        && UnicodeSegmentation::graphemes(s, true).count() <= MAX_TAGNAME_LENGTH
        && !s.contains(char::is_whitespace)
        && !s.contains(',')
}

/// Following Pinboard conventions, tags may be up to 255 "logical characters" in length; I read
/// that as Unicode graphemes. Tags may not contain whitespace or commas (commas being the
/// separator in the comma-delimited form callers may submit).
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct Tagname(String);

impl Tagname {
    /// Correct-by-construction [Tagname] constructor
    pub fn new(text: &str) -> Result<Tagname> {
        check_tagname(text)
            .then_some(Tagname(text.to_owned()))
            .ok_or(
                BadTagnameSnafu {
                    text: text.to_owned(),
                }
                .build(),
            )
    }
}

impl AsRef<str> for Tagname {
    fn as_ref(&self) -> &str {
        self.deref()
    }
}

impl Deref for Tagname {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'de> Deserialize<'de> for Tagname {
    fn deserialize<D>(deserializer: D) -> StdResult<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        Tagname::try_from(s).map_err(mk_serde_de_err::<'de, D>)
    }
}

impl Display for Tagname {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Tagname {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Tagname::new(s)
    }
}

impl TryFrom<String> for Tagname {
    type Error = Error;

    fn try_from(text: String) -> std::result::Result<Self, Self::Error> {
        if check_tagname(&text) {
            Ok(Tagname(text))
        } else {
            BadTagnameSnafu { text }.fail()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         MetadataStatus                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Per-record enrichment progress
///
/// This is a small state machine: `Pending → Processing → {Completed, Failed}`, with re-entry
/// `Failed → Processing` permitted for manual retries only. `Completed` records are never
/// re-entered by automatic logic (though a manual retry of a `Failed` record restarts the full
/// forward path). Note that `Completed` means "the pipeline ran to completion", *not* "the
/// pipeline found data": a record whose every provider came up empty still completes.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetadataStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl MetadataStatus {
    /// Is `to` a legal successor of `self`?
    pub fn may_advance_to(&self, to: MetadataStatus) -> bool {
        use MetadataStatus::*;
        matches!(
            (self, to),
            (Pending, Processing) | (Processing, Completed) | (Processing, Failed) | (Failed, Processing)
        )
    }
}

impl Display for MetadataStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetadataStatus::Pending => write!(f, "PENDING"),
            MetadataStatus::Processing => write!(f, "PROCESSING"),
            MetadataStatus::Completed => write!(f, "COMPLETED"),
            MetadataStatus::Failed => write!(f, "FAILED"),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         LifecycleStatus                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Record visibility, distinct from [MetadataStatus]
///
/// Soft deletion is performed by the record-management surface, not by anything in this crate; the
/// field exists here because query paths must read it (deleted records are invisible to search).
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleStatus {
    Active,
    Deleted,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          PageMetadata                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The canonical metadata triple: best-effort, any subset may be absent
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct PageMetadata {
    pub title: Option<String>,
    pub description: Option<String>,
    pub thumbnail: Option<String>,
}

impl PageMetadata {
    /// True if no field carries a non-blank value
    pub fn is_empty(&self) -> bool {
        fn blank(field: &Option<String>) -> bool {
            field.as_deref().map_or(true, |s| s.trim().is_empty())
        }
        blank(&self.title) && blank(&self.description) && blank(&self.thumbnail)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           LinkRecord                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The persisted unit for a link upload
///
/// Created with `metadata_status` [Pending]; the enrichment worker advances it from there. The
/// caller-supplied title/description/thumbnail (if any) are set at construction & never
/// overwritten by enrichment.
///
/// [Pending]: MetadataStatus::Pending
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct LinkRecord {
    id: ArtifactId,
    short_code: ShortCode,
    url: LinkUrl,
    title: Option<String>,
    description: Option<String>,
    thumbnail: Option<String>,
    metadata_status: MetadataStatus,
    categories: Vec<CategoryName>,
    tags: Vec<Tagname>,
    uploader_ip: IpAddr,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    status: LifecycleStatus,
}

impl LinkRecord {
    /// Create a new [LinkRecord]; fails if `categories` is empty
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        short_code: ShortCode,
        url: LinkUrl,
        overrides: PageMetadata,
        categories: Vec<CategoryName>,
        tags: Vec<Tagname>,
        uploader_ip: IpAddr,
    ) -> Result<LinkRecord> {
        ensure!(!categories.is_empty(), NoCategoriesSnafu);
        let now = Utc::now();
        Ok(LinkRecord {
            id: ArtifactId::new(),
            short_code,
            url,
            title: overrides.title,
            description: overrides.description,
            thumbnail: overrides.thumbnail,
            metadata_status: MetadataStatus::Pending,
            categories,
            tags,
            uploader_ip,
            created_at: now,
            updated_at: now,
            status: LifecycleStatus::Active,
        })
    }
    pub fn id(&self) -> ArtifactId {
        self.id
    }
    pub fn short_code(&self) -> &ShortCode {
        &self.short_code
    }
    pub fn url(&self) -> &LinkUrl {
        &self.url
    }
    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
    pub fn thumbnail(&self) -> Option<&str> {
        self.thumbnail.as_deref()
    }
    pub fn metadata_status(&self) -> MetadataStatus {
        self.metadata_status
    }
    pub fn categories(&self) -> &[CategoryName] {
        &self.categories
    }
    pub fn tags(&self) -> &[Tagname] {
        &self.tags
    }
    pub fn uploader_ip(&self) -> IpAddr {
        self.uploader_ip
    }
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
    pub fn status(&self) -> LifecycleStatus {
        self.status
    }
    /// The record's current metadata triple, as a [PageMetadata]
    pub fn metadata(&self) -> PageMetadata {
        PageMetadata {
            title: self.title.clone(),
            description: self.description.clone(),
            thumbnail: self.thumbnail.clone(),
        }
    }
    /// Advance the enrichment state machine; fails on an illegal transition
    pub fn advance_metadata_status(&mut self, to: MetadataStatus) -> Result<()> {
        ensure!(
            self.metadata_status.may_advance_to(to),
            BadTransitionSnafu {
                from: self.metadata_status,
                to
            }
        );
        self.metadata_status = to;
        self.updated_at = Utc::now();
        Ok(())
    }
    /// Merge resolved metadata into this record, filling *empty* fields only: values the caller
    /// supplied at submission always win.
    pub fn absorb_metadata(&mut self, resolved: &PageMetadata) {
        fn blank(field: &Option<String>) -> bool {
            field.as_deref().map_or(true, |s| s.trim().is_empty())
        }
        if blank(&self.title) && !blank(&resolved.title) {
            self.title = resolved.title.clone();
        }
        if blank(&self.description) && !blank(&resolved.description) {
            self.description = resolved.description.clone();
        }
        if blank(&self.thumbnail) && !blank(&resolved.thumbnail) {
            self.thumbnail = resolved.thumbnail.clone();
        }
        self.updated_at = Utc::now();
    }
    /// Soft-delete this record. Invoked by the record-management surface; the core only ever
    /// reads the flag.
    pub fn mark_deleted(&mut self) {
        self.status = LifecycleStatus::Deleted;
        self.updated_at = Utc::now();
    }
    /// Case-insensitive substring match over url, title, description & tags
    pub fn matches(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        self.url.as_ref().to_lowercase().contains(&needle)
            || self
                .title
                .as_deref()
                .map(|t| t.to_lowercase().contains(&needle))
                .unwrap_or(false)
            || self
                .description
                .as_deref()
                .map(|d| d.to_lowercase().contains(&needle))
                .unwrap_or(false)
            || self
                .tags
                .iter()
                .any(|t| t.as_ref().to_lowercase().contains(&needle))
    }
}
