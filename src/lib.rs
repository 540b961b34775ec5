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

//! # shortstash
//!
//! A small catalog service for web links. Callers submit URLs; each submission is assigned a
//! six-character short code, persisted immediately, and enriched in the background with page
//! metadata (title, description, thumbnail) drawn from one of several Open Graph resolution
//! services. The submission path never waits on the network: enrichment progress is tracked
//! per-record and surfaced through a status endpoint.
pub mod background;
pub mod entities;
pub mod enrichment;
pub mod http;
pub mod ingestion;
pub mod memory;
pub mod metadata;
pub mod short_code;
pub mod shortstash;
pub mod storage;
