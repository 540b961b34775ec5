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

//! # Short-code allocation
//!
//! Every artifact shortstash catalogues is addressed by a six-character code drawn from an
//! alphabet chosen for human transcription: uppercase letters minus the ambiguous `O`, digits
//! minus the ambiguous `0`. The keyspace is large enough that collisions are freak occurrences at
//! any realistic catalog size, so the allocator simply draws, checks the store, & re-draws,
//! giving up after a defensive bound it should never reach.
//!
//! The allocator performs no writes. Its existence check is a fast path only: two racing
//! allocators may draw the same code, and the storage layer's uniqueness check at insert
//! ([insert_link]) is the actual source of truth.
//!
//! [insert_link]: crate::storage::Backend::insert_link

use std::{collections::HashSet, sync::Arc};

use rand::Rng;
use snafu::{prelude::*, Backtrace};

use crate::{
    entities::ShortCode,
    storage::{self, Backend as StorageBackend},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Gave up allocating a short code after {attempts} collisions"))]
    Exhausted { attempts: usize, backtrace: Backtrace },
    #[snafu(display("Storage failure while checking a candidate short code: {source}"))]
    Storage {
        source: storage::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// `A-Z` less `O`, `1-9` (no `0`)
const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNPQRSTUVWXYZ123456789";

const CODE_LENGTH: usize = 6;

/// Consecutive-collision bound; hitting it means something is badly wrong (a broken RNG, or a
/// store answering "exists" unconditionally), not a full keyspace.
const MAX_DRAWS: usize = 100;

fn draw() -> ShortCode {
    let mut rng = rand::thread_rng();
    let text: String = (0..CODE_LENGTH)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    ShortCode::new(&text).unwrap(/* known good */)
}

pub struct Allocator {
    storage: Arc<dyn StorageBackend + Send + Sync>,
}

impl Allocator {
    pub fn new(storage: Arc<dyn StorageBackend + Send + Sync>) -> Allocator {
        Allocator { storage }
    }
    /// Produce a short code unused at the moment of the check
    pub async fn allocate(&self) -> Result<ShortCode> {
        self.allocate_excluding(&HashSet::new()).await
    }
    /// Produce `n` short codes with no duplicates *within* the batch
    ///
    /// Each draw is checked against the live store, but nothing is persisted between draws, so
    /// the store alone can't preclude an intra-batch duplicate; an in-memory exclusion set
    /// accumulated across the batch closes that hole.
    pub async fn allocate_batch(&self, n: usize) -> Result<Vec<ShortCode>> {
        let mut taken: HashSet<ShortCode> = HashSet::with_capacity(n);
        let mut codes = Vec::with_capacity(n);
        for _ in 0..n {
            let code = self.allocate_excluding(&taken).await?;
            taken.insert(code.clone());
            codes.push(code);
        }
        Ok(codes)
    }
    async fn allocate_excluding(&self, taken: &HashSet<ShortCode>) -> Result<ShortCode> {
        for _ in 0..MAX_DRAWS {
            let candidate = draw();
            if taken.contains(&candidate) {
                continue;
            }
            if !self
                .storage
                .short_code_exists(&candidate)
                .await
                .context(StorageSnafu)?
            {
                return Ok(candidate);
            }
        }
        ExhaustedSnafu {
            attempts: MAX_DRAWS,
        }
        .fail()
    }
}
