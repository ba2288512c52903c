// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Behaviour shared by every desired-state backend, run against each one.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use wgadmin_common::{DeviceInfo, KeyPair, PeerInfo, PeerOrder, PrivateKey, SymmetricKey};

use crate::error::RepoError;
use crate::repository::Repository;

pub fn device(name: &str) -> DeviceInfo {
	DeviceInfo::new(name, PrivateKey::generate())
		.with_listen_port(51820)
		.with_address("10.0.0.1/24".parse().unwrap())
}

pub fn peer(device: &str, name: &str) -> PeerInfo {
	PeerInfo::new(device, *KeyPair::generate().public_key())
		.with_name(name)
		.with_endpoint("192.0.2.10:51820".parse().unwrap())
		.with_allowed_ips(vec![
			"10.0.0.2/32".parse().unwrap(),
			"fd00::2/128".parse().unwrap(),
		])
		.with_preshared_key(SymmetricKey::generate())
		.with_keepalive(25)
}

fn names(peers: &[PeerInfo]) -> Vec<&str> {
	peers.iter().map(|p| p.name.as_str()).collect()
}

pub async fn two_devices_two_peers(repo: &dyn Repository) {
	let wg0 = device("wg0");
	let wg1 = device("wg1").with_address("10.1.0.1/24".parse().unwrap());
	repo.update_devices(&[wg0.clone(), wg1.clone()]).await.unwrap();

	let alice = peer("wg0", "alice");
	let bob = peer("wg0", "bob");
	let carol = peer("wg1", "carol");
	let dave = peer("wg1", "dave");
	repo.update_peers("wg0", &[alice.clone(), bob.clone()]).await.unwrap();
	repo.update_peers("wg1", &[carol.clone(), dave.clone()]).await.unwrap();

	assert_eq!(repo.list_devices().await.unwrap(), vec![wg0, wg1]);

	let (all, total) = repo.list_peers(PeerOrder::NameAsc, 0, 0).await.unwrap();
	assert_eq!(total, 4);
	assert_eq!(all, vec![alice.clone(), bob.clone(), carol.clone(), dave.clone()]);

	let (page, total) = repo.list_peers(PeerOrder::NameAsc, 1, 2).await.unwrap();
	assert_eq!(total, 4);
	assert_eq!(names(&page), vec!["bob", "carol"]);

	let (page, total) = repo.list_peers(PeerOrder::NameDesc, 0, 1).await.unwrap();
	assert_eq!(total, 4);
	assert_eq!(names(&page), vec!["dave"]);

	let (page, total) = repo.list_peers(PeerOrder::NameAsc, 10, 2).await.unwrap();
	assert_eq!(total, 4);
	assert!(page.is_empty());

	let (page, total) = repo
		.list_peers_by_devices(&["wg1".to_string()], PeerOrder::NameAsc, 0, 0)
		.await
		.unwrap();
	assert_eq!(total, 2);
	assert_eq!(names(&page), vec!["carol", "dave"]);

	let (page, total) = repo
		.list_peers_by_devices(&[], PeerOrder::NameAsc, 0, 0)
		.await
		.unwrap();
	assert_eq!(total, 0);
	assert!(page.is_empty());

	let (page, total) = repo
		.list_peers_by_keys(
			"wg0",
			&[bob.public_key, carol.public_key],
			PeerOrder::NameAsc,
			0,
			0,
		)
		.await
		.unwrap();
	assert_eq!(total, 1);
	assert_eq!(page, vec![bob.clone()]);

	repo.remove_peers("wg0", &[alice.public_key]).await.unwrap();
	let (_, total) = repo.list_peers(PeerOrder::NameAsc, 0, 0).await.unwrap();
	assert_eq!(total, 3);

	repo.remove_devices(&["wg0".to_string()]).await.unwrap();
	let devices = repo.list_devices().await.unwrap();
	assert_eq!(devices.len(), 1);
	assert_eq!(devices[0].name, "wg1");
	let (page, total) = repo.list_peers(PeerOrder::NameAsc, 0, 0).await.unwrap();
	assert_eq!(total, 2);
	assert_eq!(names(&page), vec!["carol", "dave"]);
}

pub async fn scoped_listing_ignores_repeats(repo: &dyn Repository) {
	repo.update_devices(&[device("wg0"), device("wg1")])
		.await
		.unwrap();
	let alice = peer("wg0", "alice");
	let bob = peer("wg1", "bob");
	repo.update_peers("wg0", &[alice.clone()]).await.unwrap();
	repo.update_peers("wg1", &[bob.clone()]).await.unwrap();

	let scope = ["wg0".to_string(), "wg0".to_string(), "missing".to_string()];
	let (page, total) = repo
		.list_peers_by_devices(&scope, PeerOrder::NameAsc, 0, 0)
		.await
		.unwrap();
	assert_eq!(total, 1);
	assert_eq!(page, vec![alice.clone()]);

	let (page, total) = repo
		.list_peers_by_keys(
			"wg0",
			&[alice.public_key, alice.public_key, bob.public_key],
			PeerOrder::NameAsc,
			0,
			0,
		)
		.await
		.unwrap();
	assert_eq!(total, 1);
	assert_eq!(page, vec![alice]);
}

pub async fn replace_all_devices_is_exact(repo: &dyn Repository) {
	repo.update_devices(&[device("old"), device("kept")])
		.await
		.unwrap();
	repo.update_peers("kept", &[peer("kept", "erin")])
		.await
		.unwrap();

	let kept = device("kept").with_listen_port(4500);
	let fresh = device("fresh");
	repo.replace_all_devices(&[fresh.clone(), kept.clone()])
		.await
		.unwrap();

	assert_eq!(repo.list_devices().await.unwrap(), vec![fresh, kept]);
	let (page, _) = repo.list_peers(PeerOrder::NameAsc, 0, 0).await.unwrap();
	assert_eq!(names(&page), vec!["erin"]);

	repo.replace_all_devices(&[]).await.unwrap();
	assert!(repo.list_devices().await.unwrap().is_empty());
	let (_, total) = repo.list_peers(PeerOrder::NameAsc, 0, 0).await.unwrap();
	assert_eq!(total, 0);
}

pub async fn update_devices_keeps_others(repo: &dyn Repository) {
	let wg0 = device("wg0");
	let wg1 = device("wg1");
	repo.update_devices(&[wg0, wg1.clone()]).await.unwrap();

	let mut changed = device("wg0").with_listen_port(1234);
	changed.address = None;
	repo.update_devices(&[changed.clone()]).await.unwrap();

	assert_eq!(repo.list_devices().await.unwrap(), vec![changed, wg1]);
}

pub async fn replace_all_peers_is_exact(repo: &dyn Repository) {
	repo.update_devices(&[device("wg0"), device("wg1")])
		.await
		.unwrap();
	let alice = peer("wg0", "alice");
	let bob = peer("wg0", "bob");
	let other = peer("wg1", "other");
	repo.update_peers("wg0", &[alice.clone(), bob]).await.unwrap();
	repo.update_peers("wg1", &[other.clone()]).await.unwrap();

	let renamed = alice.clone().with_name("alice2");
	let carol = peer("wg0", "carol");
	repo.replace_all_peers("wg0", &[renamed.clone(), carol.clone()])
		.await
		.unwrap();

	let (page, total) = repo
		.list_peers_by_devices(&["wg0".to_string()], PeerOrder::NameAsc, 0, 0)
		.await
		.unwrap();
	assert_eq!(total, 2);
	assert_eq!(page, vec![renamed, carol]);

	let (page, _) = repo
		.list_peers_by_devices(&["wg1".to_string()], PeerOrder::NameAsc, 0, 0)
		.await
		.unwrap();
	assert_eq!(page, vec![other]);
}

pub async fn peers_for_missing_device(repo: &dyn Repository) {
	let ghost = peer("ghost", "nobody");
	let err = repo.update_peers("ghost", &[ghost.clone()]).await.unwrap_err();
	assert!(matches!(err, RepoError::NotFound(_)), "got {err:?}");

	let err = repo.replace_all_peers("ghost", &[ghost]).await.unwrap_err();
	assert!(matches!(err, RepoError::NotFound(_)), "got {err:?}");

	let (page, total) = repo
		.list_peers_by_keys("ghost", &[], PeerOrder::NameAsc, 0, 0)
		.await
		.unwrap();
	assert_eq!(total, 0);
	assert!(page.is_empty());
}

pub async fn invalid_input_rejected(repo: &dyn Repository) {
	let zero = DeviceInfo::new("wg0", PrivateKey::from_bytes([0u8; 32]));
	let err = repo.update_devices(&[zero]).await.unwrap_err();
	assert!(matches!(err, RepoError::InvalidInput(_)), "got {err:?}");

	repo.update_devices(&[device("wg0")]).await.unwrap();
	let misplaced = peer("wg1", "misplaced");
	let err = repo.update_peers("wg0", &[misplaced]).await.unwrap_err();
	assert!(matches!(err, RepoError::InvalidInput(_)), "got {err:?}");

	let (_, total) = repo.list_peers(PeerOrder::NameAsc, 0, 0).await.unwrap();
	assert_eq!(total, 0);
}

pub async fn duplicate_public_key_rejected(repo: &dyn Repository) {
	let original = device("wg0");
	let mut clash = device("wg1");
	clash.private_key = original.private_key.clone();

	repo.update_devices(&[original.clone()]).await.unwrap();
	let err = repo.update_devices(&[clash]).await.unwrap_err();
	assert!(matches!(err, RepoError::AlreadyExists(_)), "got {err:?}");
	assert_eq!(repo.list_devices().await.unwrap(), vec![original]);
}

pub async fn public_keys_can_swap(repo: &dyn Repository) {
	let wg0 = device("wg0");
	let wg1 = device("wg1");
	repo.update_devices(&[wg0.clone(), wg1.clone()]).await.unwrap();

	let mut swapped0 = wg0.clone();
	swapped0.private_key = wg1.private_key.clone();
	let mut swapped1 = wg1.clone();
	swapped1.private_key = wg0.private_key.clone();
	repo.update_devices(&[swapped0.clone(), swapped1.clone()])
		.await
		.unwrap();
	assert_eq!(
		repo.list_devices().await.unwrap(),
		vec![swapped0.clone(), swapped1.clone()]
	);

	repo.replace_all_devices(&[wg0.clone(), wg1.clone()])
		.await
		.unwrap();
	assert_eq!(repo.list_devices().await.unwrap(), vec![wg0.clone(), wg1.clone()]);

	// Taking the key of a device outside the batch is still a clash.
	let mut thief = wg0.clone();
	thief.private_key = wg1.private_key.clone();
	let err = repo.update_devices(&[thief]).await.unwrap_err();
	assert!(matches!(err, RepoError::AlreadyExists(_)), "got {err:?}");
	assert_eq!(repo.list_devices().await.unwrap(), vec![wg0, wg1]);
}

pub async fn writes_notify_once(repo: &dyn Repository) {
	let (tx, mut rx) = mpsc::channel(8);
	let (removed_tx, mut removed_rx) = mpsc::channel(8);
	repo.add_change_notification(tx.clone());
	repo.add_change_notification(tx);
	repo.add_change_notification(removed_tx.clone());
	repo.remove_change_notification(&removed_tx);

	repo.update_devices(&[device("wg0"), device("wg1")])
		.await
		.unwrap();
	assert_eq!(rx.recv().await, Some(()));
	assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

	repo.update_peers("wg0", &[peer("wg0", "a"), peer("wg0", "b")])
		.await
		.unwrap();
	assert_eq!(rx.recv().await, Some(()));
	assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

	let carol = peer("wg0", "carol");
	repo.replace_all_peers("wg0", &[carol.clone()]).await.unwrap();
	assert_eq!(rx.recv().await, Some(()));
	assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

	repo.remove_peers("wg0", &[carol.public_key]).await.unwrap();
	assert_eq!(rx.recv().await, Some(()));
	assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

	repo.remove_devices(&["wg1".to_string()]).await.unwrap();
	assert_eq!(rx.recv().await, Some(()));
	assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

	repo.replace_all_devices(&[device("wg2"), device("wg3")])
		.await
		.unwrap();
	assert_eq!(rx.recv().await, Some(()));
	assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

	assert_eq!(removed_rx.try_recv(), Err(TryRecvError::Empty));
}

pub async fn failed_write_does_not_notify(repo: &dyn Repository) {
	let (tx, mut rx) = mpsc::channel(8);
	repo.add_change_notification(tx);

	assert!(repo
		.update_peers("missing", &[peer("missing", "x")])
		.await
		.is_err());
	assert!(repo
		.replace_all_peers("missing", &[peer("missing", "x")])
		.await
		.is_err());
	assert!(repo
		.remove_peers("missing", &[*KeyPair::generate().public_key()])
		.await
		.is_err());

	let zero = DeviceInfo::new("wg0", PrivateKey::from_bytes([0u8; 32]));
	assert!(repo.update_devices(&[zero.clone()]).await.is_err());
	assert!(repo.replace_all_devices(&[zero]).await.is_err());

	let original = device("wg0");
	let mut clash = device("wg1");
	clash.private_key = original.private_key.clone();
	assert!(repo
		.update_devices(&[original.clone(), clash.clone()])
		.await
		.is_err());
	assert!(repo.replace_all_devices(&[original, clash]).await.is_err());

	tokio::task::yield_now().await;
	assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
	assert!(repo.list_devices().await.unwrap().is_empty());
}

pub async fn close_closes_listeners(repo: &dyn Repository) {
	let (tx, mut rx) = mpsc::channel(1);
	repo.add_change_notification(tx);
	repo.close().await.unwrap();
	repo.close().await.unwrap();
	assert_eq!(rx.recv().await, None);
}
