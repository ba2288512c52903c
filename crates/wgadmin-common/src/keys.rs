// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Fixed-size WireGuard keys.
//!
//! All three key roles share the same 32-byte layout and the same text
//! encoding (64 hex characters), which is also what the UAPI control protocol
//! and the SQLite store use. Secret keys are zeroized on drop and never
//! printed.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use x25519_dalek::{PublicKey as DalekPublicKey, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

pub const KEY_LEN: usize = 32;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum KeyError {
	#[error("invalid key length: expected 32 bytes, got {0}")]
	InvalidLength(usize),

	#[error("invalid hex encoding: {0}")]
	InvalidHex(#[from] hex::FromHexError),
}

pub type Result<T> = std::result::Result<T, KeyError>;

fn decode_hex(s: &str) -> Result<[u8; KEY_LEN]> {
	let bytes = hex::decode(s)?;
	if bytes.len() != KEY_LEN {
		return Err(KeyError::InvalidLength(bytes.len()));
	}
	let mut arr = [0u8; KEY_LEN];
	arr.copy_from_slice(&bytes);
	Ok(arr)
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey {
	bytes: [u8; KEY_LEN],
}

impl PublicKey {
	pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
		Self { bytes }
	}

	pub fn from_hex(s: &str) -> Result<Self> {
		Ok(Self {
			bytes: decode_hex(s)?,
		})
	}

	pub fn to_hex(&self) -> String {
		hex::encode(self.bytes)
	}

	pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
		&self.bytes
	}
}

impl FromStr for PublicKey {
	type Err = KeyError;

	fn from_str(s: &str) -> Result<Self> {
		Self::from_hex(s)
	}
}

impl fmt::Debug for PublicKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let hex = self.to_hex();
		f.debug_struct("PublicKey")
			.field("prefix", &format!("{}...", &hex[..8]))
			.finish()
	}
}

impl fmt::Display for PublicKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.to_hex())
	}
}

impl Serialize for PublicKey {
	fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(&self.to_hex())
	}
}

impl<'de> Deserialize<'de> for PublicKey {
	fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Self::from_hex(&s).map_err(serde::de::Error::custom)
	}
}

#[derive(Clone, PartialEq, Eq, Zeroize)]
#[zeroize(drop)]
pub struct PrivateKey {
	bytes: [u8; KEY_LEN],
}

impl PrivateKey {
	pub fn generate() -> Self {
		let secret = StaticSecret::random_from_rng(OsRng);
		Self {
			bytes: secret.to_bytes(),
		}
	}

	pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
		Self { bytes }
	}

	pub fn from_hex(s: &str) -> Result<Self> {
		let bytes = Zeroizing::new(decode_hex(s)?);
		Ok(Self { bytes: *bytes })
	}

	pub fn to_hex(&self) -> Zeroizing<String> {
		Zeroizing::new(hex::encode(self.bytes))
	}

	/// Derives the public half with X25519 base-point multiplication.
	pub fn public_key(&self) -> PublicKey {
		let secret = StaticSecret::from(self.bytes);
		let public = DalekPublicKey::from(&secret);
		PublicKey {
			bytes: *public.as_bytes(),
		}
	}

	pub fn is_zero(&self) -> bool {
		self.bytes.iter().all(|b| *b == 0)
	}

	pub fn expose_bytes(&self) -> &[u8; KEY_LEN] {
		&self.bytes
	}
}

impl fmt::Debug for PrivateKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("PrivateKey")
			.field("bytes", &"[REDACTED]")
			.finish()
	}
}

impl fmt::Display for PrivateKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("[REDACTED]")
	}
}

impl Serialize for PrivateKey {
	fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str("[REDACTED]")
	}
}

impl<'de> Deserialize<'de> for PrivateKey {
	fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		let s = Zeroizing::new(String::deserialize(deserializer)?);
		Self::from_hex(&s).map_err(serde::de::Error::custom)
	}
}

/// Pre-shared key mixed into the handshake of a single peer.
#[derive(Clone, PartialEq, Eq, Zeroize)]
#[zeroize(drop)]
pub struct SymmetricKey {
	bytes: [u8; KEY_LEN],
}

impl SymmetricKey {
	pub fn generate() -> Self {
		let mut bytes = [0u8; KEY_LEN];
		OsRng.fill_bytes(&mut bytes);
		Self { bytes }
	}

	pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
		Self { bytes }
	}

	pub fn from_hex(s: &str) -> Result<Self> {
		Ok(Self {
			bytes: decode_hex(s)?,
		})
	}

	pub fn to_hex(&self) -> Zeroizing<String> {
		Zeroizing::new(hex::encode(self.bytes))
	}

	pub fn expose_bytes(&self) -> &[u8; KEY_LEN] {
		&self.bytes
	}
}

impl fmt::Debug for SymmetricKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SymmetricKey")
			.field("bytes", &"[REDACTED]")
			.finish()
	}
}

impl Serialize for SymmetricKey {
	fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str("[REDACTED]")
	}
}

impl<'de> Deserialize<'de> for SymmetricKey {
	fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		let s = Zeroizing::new(String::deserialize(deserializer)?);
		Self::from_hex(&s).map_err(serde::de::Error::custom)
	}
}

#[derive(Clone)]
pub struct KeyPair {
	private: PrivateKey,
	public: PublicKey,
}

impl KeyPair {
	pub fn generate() -> Self {
		Self::from_private_key(PrivateKey::generate())
	}

	pub fn from_private_key(private: PrivateKey) -> Self {
		let public = private.public_key();
		Self { private, public }
	}

	pub fn private_key(&self) -> &PrivateKey {
		&self.private
	}

	pub fn public_key(&self) -> &PublicKey {
		&self.public
	}
}

impl fmt::Debug for KeyPair {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("KeyPair")
			.field("private", &self.private)
			.field("public", &self.public)
			.finish()
	}
}
