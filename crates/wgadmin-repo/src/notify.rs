// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, instrument};

/// Fan-out of zero-payload change events to registered listeners.
///
/// Delivery is fire-and-forget: a full listener misses that event and a
/// closed listener is skipped, without affecting the others or the writer.
#[derive(Debug, Default)]
pub struct ChangeNotifier {
	listeners: Mutex<Vec<mpsc::Sender<()>>>,
}

impl ChangeNotifier {
	pub fn new() -> Self {
		Self::default()
	}

	// The set holds no invariant a panicking holder could break.
	fn listeners(&self) -> MutexGuard<'_, Vec<mpsc::Sender<()>>> {
		self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
	}

	pub fn add(&self, listener: mpsc::Sender<()>) {
		let mut listeners = self.listeners();
		if !listeners.iter().any(|l| l.same_channel(&listener)) {
			listeners.push(listener);
		}
	}

	pub fn remove(&self, listener: &mpsc::Sender<()>) {
		self.listeners().retain(|l| !l.same_channel(listener));
	}

	pub fn listener_count(&self) -> usize {
		self.listeners().len()
	}

	#[instrument(skip(self))]
	pub fn notify_change(&self) {
		let snapshot = self.listeners().clone();
		if snapshot.is_empty() {
			return;
		}

		match Handle::try_current() {
			Ok(handle) => {
				handle.spawn(async move { deliver(&snapshot) });
			}
			Err(_) => deliver(&snapshot),
		}
	}

	/// Drops every registered sender. Safe to call more than once.
	pub fn close(&self) {
		let mut listeners = self.listeners();
		debug!(count = listeners.len(), "dropping change listeners");
		listeners.clear();
	}
}

fn deliver(listeners: &[mpsc::Sender<()>]) {
	for listener in listeners {
		match listener.try_send(()) {
			Ok(()) => {}
			Err(TrySendError::Full(())) => debug!("change listener full, event dropped"),
			Err(TrySendError::Closed(())) => debug!("change listener closed"),
		}
	}
}
