// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

pub mod keys;
pub mod order;
pub mod types;

pub use keys::{KeyError, KeyPair, PrivateKey, PublicKey, SymmetricKey, KEY_LEN};
pub use order::{page_range, paginate, sort_and_paginate, InvalidPeerOrder, PeerOrder};
pub use types::{parse_cidr, DeviceInfo, PeerInfo, ValidationError};
