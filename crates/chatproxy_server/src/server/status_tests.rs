#![forbid(unsafe_code)]

use std::time::Duration;

use chatproxy_domain::{MemberStateChange, PersonaState, ProxyStatus};
use chatproxy_platform::ClientEvent;
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;

use crate::server::status::{JoinOutcome, LoginOutcome, ProxyEvent, StatusError};
use crate::server::test_support::{Call, Harness, PROXY_ID, eventually, member, room, uid};

#[tokio::test]
async fn login_when_not_offline_skips_the_network() {
	let h = Harness::new();
	h.ready().await;
	assert_eq!(h.client.count(|c| *c == Call::LogOn), 1);

	let outcome = h
		.ctx
		.status
		.login_if_offline(Duration::from_millis(500))
		.await
		.expect("already connected");
	assert_eq!(outcome, LoginOutcome::AlreadyConnected);
	assert_eq!(h.client.count(|c| *c == Call::LogOn), 1);

	h.ctx.status.connect().await;
	assert_eq!(h.client.count(|c| *c == Call::LogOn), 1);
}

#[tokio::test]
async fn concurrent_logins_share_one_request() {
	let h = Harness::new();

	let (a, b) = tokio::join!(
		h.ctx.status.login_if_offline(Duration::from_millis(500)),
		h.ctx.status.login_if_offline(Duration::from_millis(500)),
	);

	assert_eq!(a.expect("first waiter"), LoginOutcome::Connected);
	assert_eq!(b.expect("second waiter"), LoginOutcome::Connected);
	assert_eq!(h.client.count(|c| *c == Call::LogOn), 1);
	assert_eq!(h.ctx.status.status(), ProxyStatus::NotInChat);
	assert_eq!(h.ctx.status.self_id(), Some(uid(PROXY_ID)));
}

#[tokio::test]
async fn login_times_out_when_network_never_answers() {
	let h = Harness::silent();

	let err = h
		.ctx
		.status
		.login_if_offline(Duration::from_millis(100))
		.await
		.expect_err("no LoggedOn event arrives");
	assert!(matches!(err, StatusError::Timeout { what: "log on", .. }), "got {err:?}");
	assert_eq!(h.ctx.status.status(), ProxyStatus::Offline);

	h.ctx.status.connect().await;
	assert_eq!(h.client.count(|c| *c == Call::LogOn), 2, "a finished wait no longer blocks reconnects");

	h.network(ClientEvent::LoggedOn { self_id: uid(PROXY_ID) }).await;
	assert!(eventually(|| h.ctx.status.status() == ProxyStatus::NotInChat).await);
	assert_eq!(h.ctx.status.self_id(), Some(uid(PROXY_ID)));
}

#[tokio::test]
async fn reconnect_loop_logs_on_again_after_a_drop() {
	let h = Harness::build(true, true, |cfg| cfg.reconnect_interval = Duration::from_millis(30));
	let shutdown = CancellationToken::new();
	let reconnect = h.ctx.status.spawn_reconnect_loop(shutdown.clone());

	assert!(eventually(|| h.ctx.status.status() == ProxyStatus::NotInChat).await);
	tokio::time::sleep(Duration::from_millis(120)).await;
	assert_eq!(h.client.count(|c| *c == Call::LogOn), 1, "no log on while connected");

	h.network(ClientEvent::Disconnected { reason: Some("network drop".to_string()) }).await;
	assert!(eventually(|| h.client.count(|c| *c == Call::LogOn) >= 2).await);
	assert!(eventually(|| h.ctx.status.status() == ProxyStatus::NotInChat).await);

	shutdown.cancel();
	timeout(Duration::from_secs(2), reconnect)
		.await
		.expect("reconnect loop stops on shutdown")
		.expect("reconnect task");
}

#[tokio::test]
async fn join_reconciles_when_network_already_lists_proxy() {
	let h = Harness::new();
	h.ctx
		.status
		.login_if_offline(Duration::from_millis(500))
		.await
		.expect("log on");

	h.network(ClientEvent::RoomEntered {
		room: room(),
		members: vec![member(PROXY_ID, "ChatProxy")],
	})
	.await;
	assert!(eventually(|| h.ctx.status.proxy_in_room()).await);

	let outcome = h.ctx.status.join_chat(Duration::from_millis(500)).await.expect("join");
	assert_eq!(outcome, JoinOutcome::Reconciled);
	assert_eq!(h.client.count(|c| matches!(c, Call::Join(_))), 0);
	assert_eq!(h.ctx.status.status(), ProxyStatus::InChatUnmuted);
}

#[tokio::test]
async fn join_without_presence_times_out_and_stays_not_in_chat() {
	let h = Harness::build(true, false, |_| {});
	h.ctx
		.status
		.login_if_offline(Duration::from_millis(500))
		.await
		.expect("log on");

	let started = Instant::now();
	let err = h
		.ctx
		.status
		.join_chat(Duration::from_millis(500))
		.await
		.expect_err("network never lists the proxy");
	let elapsed = started.elapsed();

	assert!(matches!(err, StatusError::Timeout { what: "room join", .. }), "got {err:?}");
	assert!(elapsed >= Duration::from_millis(490), "resolved too early: {elapsed:?}");
	assert!(elapsed < Duration::from_millis(900), "resolved too late: {elapsed:?}");
	assert_eq!(h.ctx.status.status(), ProxyStatus::NotInChat);
	assert_eq!(h.client.count(|c| matches!(c, Call::Join(_))), 1);
}

#[tokio::test]
async fn join_while_offline_is_skipped() {
	let h = Harness::silent();
	let outcome = h.ctx.status.join_chat(Duration::from_millis(100)).await.expect("skip");
	assert_eq!(outcome, JoinOutcome::SkippedOffline);
	assert!(h.client.calls().is_empty());
}

#[tokio::test]
async fn mute_survives_leave_and_rejoin() {
	let h = Harness::new();
	h.ready().await;

	h.ctx.status.mute();
	assert_eq!(h.ctx.status.status(), ProxyStatus::InChatMuted);

	h.ctx.status.leave_chat().await;
	assert_eq!(h.ctx.status.status(), ProxyStatus::NotInChat);
	assert!(h.ctx.status.is_muted());

	let outcome = h.ctx.status.join_chat(Duration::from_millis(500)).await.expect("rejoin");
	assert_eq!(outcome, JoinOutcome::Joined);
	assert_eq!(h.ctx.status.status(), ProxyStatus::InChatMuted);

	h.ctx.status.unmute();
	h.ctx.status.leave_chat().await;
	h.ctx.status.join_chat(Duration::from_millis(500)).await.expect("rejoin");
	assert_eq!(h.ctx.status.status(), ProxyStatus::InChatUnmuted);
}

#[tokio::test]
async fn mute_and_unmute_only_apply_in_chat() {
	let h = Harness::new();
	h.ctx.status.mute();
	assert_eq!(h.ctx.status.status(), ProxyStatus::Offline);
	assert!(!h.ctx.status.is_muted());

	h.ready().await;
	h.ctx.status.unmute();
	assert_eq!(h.ctx.status.status(), ProxyStatus::InChatUnmuted);
}

#[tokio::test]
async fn leave_goes_invisible_then_announces_online() {
	let h = Harness::new();
	h.ready().await;
	let online_before = h.client.count(|c| *c == Call::Persona(PersonaState::Online));

	h.ctx.status.leave_chat().await;
	assert_eq!(h.client.count(|c| *c == Call::Persona(PersonaState::Offline)), 1);
	assert!(!h.ctx.status.proxy_in_room());

	assert!(
		eventually(|| h.client.count(|c| *c == Call::Persona(PersonaState::Online)) == online_before + 1).await,
		"persona not re-announced after the rejoin delay"
	);
}

#[tokio::test]
async fn disconnect_cancels_pending_join_and_forces_offline() {
	let h = Harness::build(true, false, |_| {});
	h.ctx
		.status
		.login_if_offline(Duration::from_millis(500))
		.await
		.expect("log on");

	let status = h.ctx.status.clone();
	let pending = tokio::spawn(async move { status.join_chat(Duration::from_secs(10)).await });
	assert!(eventually(|| h.client.count(|c| matches!(c, Call::Join(_))) == 1).await);

	h.network(ClientEvent::Disconnected { reason: None }).await;

	let result = timeout(Duration::from_secs(2), pending)
		.await
		.expect("join resolves after disconnect")
		.expect("join task");
	assert!(matches!(result, Err(StatusError::Cancelled { .. })), "got {result:?}");
	assert_eq!(h.ctx.status.status(), ProxyStatus::Offline);
	assert!(h.ctx.status.chat_members().is_empty());
}

#[tokio::test]
async fn status_events_carry_old_and_new() {
	let h = Harness::new();
	let mut rx = h.ctx.status.subscribe();

	h.ready().await;
	h.ctx.status.mute();

	let mut seen = Vec::new();
	while let Ok(ev) = rx.try_recv() {
		if let ProxyEvent::StatusChanged { old, new } = ev {
			seen.push((old, new));
		}
	}
	assert_eq!(
		seen,
		vec![
			(ProxyStatus::Offline, ProxyStatus::NotInChat),
			(ProxyStatus::NotInChat, ProxyStatus::InChatUnmuted),
			(ProxyStatus::InChatUnmuted, ProxyStatus::InChatMuted),
		]
	);
}

#[tokio::test]
async fn kick_of_proxy_drops_to_not_in_chat() {
	let h = Harness::new();
	h.client.set_members(vec![member("7", "Alice")]);
	h.ready().await;

	h.network(ClientEvent::MemberStateChanged {
		change: MemberStateChange::KICKED,
		target: uid(PROXY_ID),
		room: room(),
		actor: Some(uid("7")),
	})
	.await;

	assert!(eventually(|| h.ctx.status.status() == ProxyStatus::NotInChat).await);
	assert!(!h.ctx.status.proxy_in_room());
}

#[tokio::test]
async fn proxy_leaving_the_room_drops_to_not_in_chat_and_rejoins() {
	for change in [MemberStateChange::LEFT, MemberStateChange::DISCONNECTED] {
		let h = Harness::new();
		h.ready().await;
		assert_eq!(h.client.count(|c| matches!(c, Call::Join(_))), 1);

		h.network(ClientEvent::MemberStateChanged {
			change,
			target: uid(PROXY_ID),
			room: room(),
			actor: None,
		})
		.await;

		assert!(
			eventually(|| h.ctx.status.status() == ProxyStatus::NotInChat).await,
			"{change} of the proxy should leave chat"
		);
		assert!(!h.ctx.status.proxy_in_room());

		let outcome = h
			.ctx
			.status
			.join_chat(Duration::from_millis(500))
			.await
			.expect("rejoin");
		assert_eq!(outcome, JoinOutcome::Joined);
		assert_eq!(h.client.count(|c| matches!(c, Call::Join(_))), 2);
		assert_eq!(h.ctx.status.status(), ProxyStatus::InChatUnmuted);
	}
}

#[tokio::test]
async fn member_events_are_published_for_known_users_only() {
	let h = Harness::new();
	h.client.set_members(vec![member("7", "Alice"), member("8", "Bob")]);
	h.ready().await;
	let mut rx = h.ctx.status.subscribe();

	h.network(ClientEvent::MemberStateChanged {
		change: MemberStateChange::LEFT,
		target: uid("7"),
		room: room(),
		actor: None,
	})
	.await;
	h.network(ClientEvent::MemberStateChanged {
		change: MemberStateChange::JOINED,
		target: uid("99"),
		room: room(),
		actor: Some(uid("8")),
	})
	.await;

	assert!(eventually(|| h.ctx.status.is_user_in_room(&uid("99"))).await);
	assert!(!h.ctx.status.is_user_in_room(&uid("7")));

	let ev = rx.try_recv().expect("event for known user");
	match ev {
		ProxyEvent::MemberStateChanged {
			change,
			user,
			acted_on_by,
		} => {
			assert_eq!(change, MemberStateChange::LEFT);
			assert_eq!(user.name, "Alice");
			assert!(acted_on_by.is_none());
		}
		other => panic!("unexpected event: {other:?}"),
	}
	assert!(rx.try_recv().is_err(), "unknown users must not be published");
	assert!(!h.ctx.status.chat_members().contains_key(&uid("99")));
}

#[tokio::test]
async fn persona_changes_outside_the_room_are_cached_silently() {
	let h = Harness::new();
	h.client.set_members(vec![member("7", "Alice")]);
	h.ready().await;
	let mut rx = h.ctx.status.subscribe();

	h.network(ClientEvent::PersonaStateChanged(member("55", "Stranger"))).await;
	h.network(ClientEvent::PersonaStateChanged(member("7", "Alicia"))).await;
	assert!(eventually(|| h.ctx.status.member_name(&uid("7")).as_deref() == Some("Alicia")).await);

	assert_eq!(h.ctx.status.member_name(&uid("55")).as_deref(), Some("Stranger"));
	match rx.try_recv().expect("in-room persona change") {
		ProxyEvent::PersonaChanged(m) => assert_eq!(m.name, "Alicia"),
		other => panic!("unexpected event: {other:?}"),
	}
	assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn presence_notices_are_skipped_for_users_in_the_room() {
	let h = Harness::new();
	h.client.set_members(vec![member("7", "Alice")]);
	h.ready().await;

	assert!(!h.ctx.status.send_joined_notice(&uid("7"), "Alice").await.expect("send"));
	assert!(h.ctx.status.send_joined_notice(&uid("42"), "Answer").await.expect("send"));
	assert_eq!(h.client.sent_texts(), vec!["* Answer (42) joined from website *".to_string()]);

	h.ctx.status.mute();
	assert!(!h.ctx.status.send_left_notice(&uid("42"), "Answer").await.expect("send"));
	assert!(h.ctx.status.send_notice("still here").await.expect("send"));
}
