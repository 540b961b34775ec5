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

//! Application state available to all handlers

use std::sync::Arc;

use crate::{
    background::TaskQueue,
    enrichment::Context,
    ingestion::Service,
    storage::Backend as StorageBackend,
};

/// Everything the HTTP layer needs, built once at startup & shared via [Arc]
pub struct Shortstash {
    pub service: Service,
}

impl Shortstash {
    /// Wire-up the ingestion service over its collaborators. The caller keeps its own handles to
    /// `storage` & `queue` (the queue must also be handed to the background processor as the
    /// receiving end).
    pub fn new(
        storage: Arc<dyn StorageBackend + Send + Sync>,
        queue: Arc<TaskQueue<Context>>,
    ) -> Shortstash {
        Shortstash {
            service: Service::new(storage, queue),
        }
    }
}
