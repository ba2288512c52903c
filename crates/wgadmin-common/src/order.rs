// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Ordering and pagination over peer collections.
//!
//! Every backend sorts with [`PeerOrder::compare`] (or SQL that mirrors it)
//! and slices with [`paginate`], so listings agree across backends.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::ops::Range;
use thiserror::Error;

use crate::types::PeerInfo;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("invalid peer order code: {0}")]
pub struct InvalidPeerOrder(pub i32);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerOrder {
	#[default]
	NameAsc,
	NameDesc,
	LastHandshakeAsc,
	LastHandshakeDesc,
}

impl PeerOrder {
	pub const ALL: [PeerOrder; 4] = [
		PeerOrder::NameAsc,
		PeerOrder::NameDesc,
		PeerOrder::LastHandshakeAsc,
		PeerOrder::LastHandshakeDesc,
	];

	pub fn code(self) -> i32 {
		match self {
			PeerOrder::NameAsc => 0,
			PeerOrder::NameDesc => 1,
			PeerOrder::LastHandshakeAsc => 2,
			PeerOrder::LastHandshakeDesc => 3,
		}
	}

	/// Converts a code that is known to be valid.
	///
	/// # Panics
	///
	/// Panics on an unknown code. Codes from outside the process go through
	/// `PeerOrder::try_from` instead.
	pub fn from_code(code: i32) -> Self {
		match Self::try_from(code) {
			Ok(order) => order,
			Err(e) => panic!("{e}"),
		}
	}

	pub fn is_descending(self) -> bool {
		matches!(self, PeerOrder::NameDesc | PeerOrder::LastHandshakeDesc)
	}

	pub fn compare(self, a: &PeerInfo, b: &PeerInfo) -> Ordering {
		match self {
			PeerOrder::NameAsc => by_name(a, b),
			PeerOrder::NameDesc => by_name(a, b).reverse(),
			PeerOrder::LastHandshakeAsc => by_last_handshake(a, b),
			PeerOrder::LastHandshakeDesc => by_last_handshake(a, b).reverse(),
		}
	}

	pub fn sort(self, peers: &mut [PeerInfo]) {
		peers.sort_by(|a, b| self.compare(a, b));
	}
}

impl TryFrom<i32> for PeerOrder {
	type Error = InvalidPeerOrder;

	fn try_from(code: i32) -> Result<Self, Self::Error> {
		match code {
			0 => Ok(PeerOrder::NameAsc),
			1 => Ok(PeerOrder::NameDesc),
			2 => Ok(PeerOrder::LastHandshakeAsc),
			3 => Ok(PeerOrder::LastHandshakeDesc),
			other => Err(InvalidPeerOrder(other)),
		}
	}
}

fn by_name(a: &PeerInfo, b: &PeerInfo) -> Ordering {
	a.name
		.cmp(&b.name)
		.then_with(|| a.public_key.cmp(&b.public_key))
}

// `None` sorts before any handshake.
fn by_last_handshake(a: &PeerInfo, b: &PeerInfo) -> Ordering {
	a.last_handshake
		.cmp(&b.last_handshake)
		.then_with(|| a.public_key.cmp(&b.public_key))
}

/// Index range of the requested page. A `limit` of zero means unbounded.
pub fn page_range(total: usize, offset: usize, limit: usize) -> Range<usize> {
	if offset >= total {
		return total..total;
	}
	let end = if limit == 0 {
		total
	} else {
		offset.saturating_add(limit).min(total)
	};
	offset..end
}

/// Returns the page and the total count before pagination.
pub fn paginate<T>(mut items: Vec<T>, offset: usize, limit: usize) -> (Vec<T>, usize) {
	let total = items.len();
	let range = page_range(total, offset, limit);
	items.truncate(range.end);
	let page = items.split_off(range.start);
	(page, total)
}

pub fn sort_and_paginate(
	mut peers: Vec<PeerInfo>,
	order: PeerOrder,
	offset: usize,
	limit: usize,
) -> (Vec<PeerInfo>, usize) {
	order.sort(&mut peers);
	paginate(peers, offset, limit)
}
