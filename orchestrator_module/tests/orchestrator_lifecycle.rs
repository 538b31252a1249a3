mod test_support;

use std::error::Error;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use orchestrator_module::{InboundMessage, ItemStatus, CALENDAR_SCOPE, GMAIL_SCOPE};
use test_support::{chat_message, wait_until, Harness};

#[test]
fn stopped_user_gets_no_further_analysis() -> Result<(), Box<dyn Error>> {
    let harness = Harness::new(true);
    harness.grant("u1", &[GMAIL_SCOPE]);

    harness.orchestrator.start_services_for_user("u1");
    assert!(wait_until(Duration::from_secs(5), || {
        harness.analyzer.email_calls.load(Ordering::SeqCst) >= 1
    }));

    harness.orchestrator.stop_services_for_user("u1");
    assert!(!harness.orchestrator.is_running_for_user("u1"));
    let calls_at_stop = harness.analyzer.total_calls();
    let polls_at_stop = harness.mail.polls.load(Ordering::SeqCst);

    // Longer than one poll interval.
    thread::sleep(Duration::from_millis(2500));

    assert_eq!(harness.analyzer.total_calls(), calls_at_stop);
    assert_eq!(harness.mail.polls.load(Ordering::SeqCst), polls_at_stop);
    Ok(())
}

#[test]
fn granting_calendar_later_keeps_running_workers() -> Result<(), Box<dyn Error>> {
    let harness = Harness::new(true);
    let channel = harness.store.attach_channel("u1", "discord", "chan-1", Some("general"))?;
    assert!(harness.registry.attach_listener(&channel)?);

    harness.grant("u1", &[GMAIL_SCOPE]);
    harness.orchestrator.start_services_for_user("u1");
    let email_poller = harness
        .orchestrator
        .email_poller("u1")
        .ok_or("email poller missing")?;

    harness.grant("u1", &[CALENDAR_SCOPE]);
    harness.orchestrator.start_services_for_user("u1");

    let email_after = harness
        .orchestrator
        .email_poller("u1")
        .ok_or("email poller missing after upgrade")?;
    assert!(Arc::ptr_eq(&email_poller, &email_after));
    assert!(harness.orchestrator.calendar_poller("u1").is_some());
    assert_eq!(harness.registry.listener_count("u1"), 1);
    assert_eq!(harness.chat.active_listeners.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn stop_releases_chat_listeners() -> Result<(), Box<dyn Error>> {
    let harness = Harness::new(true);
    let first = harness.store.attach_channel("u1", "discord", "chan-1", None)?;
    let second = harness.store.attach_channel("u1", "discord", "chan-2", None)?;
    harness.registry.attach_listener(&first)?;
    harness.registry.attach_listener(&second)?;
    harness.grant("u1", &[CALENDAR_SCOPE]);
    harness.orchestrator.start_services_for_user("u1");

    harness.orchestrator.stop_services_for_user("u1");

    assert_eq!(harness.registry.listener_count("u1"), 0);
    assert_eq!(harness.chat.active_listeners.load(Ordering::SeqCst), 0);
    assert_eq!(harness.orchestrator.worker_counts().calendar_pollers, 0);
    Ok(())
}

#[test]
fn live_chat_message_becomes_pending_proposal() -> Result<(), Box<dyn Error>> {
    let harness = Harness::new(true);
    let channel = harness.store.attach_channel("u1", "discord", "chan-1", None)?;
    assert!(harness.orchestrator.start_global_processor());

    harness.sender.push(InboundMessage {
        user_id: "u1".to_string(),
        platform: channel.platform.clone(),
        external_channel_id: channel.external_channel_id.clone(),
        message: chat_message("m1", "let's meet for lunch tomorrow", 0),
    })?;

    assert!(wait_until(Duration::from_secs(5), || {
        harness
            .store
            .list_items("u1", &[ItemStatus::Pending])
            .map(|items| items.len() == 1)
            .unwrap_or(false)
    }));
    assert_eq!(harness.analyzer.chat_calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.store.count_channel_messages(&channel.id)?, 1);
    Ok(())
}

#[test]
fn messages_for_disabled_channels_are_ignored() -> Result<(), Box<dyn Error>> {
    let harness = Harness::new(true);
    let channel = harness.store.attach_channel("u1", "discord", "chan-1", None)?;
    harness.store.set_channel_enabled(&channel.id, false)?;
    harness.orchestrator.start_global_processor();

    harness.sender.push(InboundMessage {
        user_id: "u1".to_string(),
        platform: "discord".to_string(),
        external_channel_id: "chan-1".to_string(),
        message: chat_message("m1", "meet at noon", 0),
    })?;

    assert!(wait_until(Duration::from_secs(5), || harness.sender.is_empty()));
    thread::sleep(Duration::from_millis(200));
    assert_eq!(harness.analyzer.total_calls(), 0);
    assert_eq!(harness.store.count_channel_messages(&channel.id)?, 0);
    Ok(())
}

#[test]
fn restart_scan_restores_granted_users_once() -> Result<(), Box<dyn Error>> {
    let harness = Harness::new(true);
    harness.grant("u1", &[GMAIL_SCOPE, CALENDAR_SCOPE]);
    harness.grant("u2", &[CALENDAR_SCOPE]);

    assert_eq!(harness.orchestrator.start_services_for_eligible_users(), 2);
    assert_eq!(harness.orchestrator.start_services_for_eligible_users(), 0);

    let counts = harness.orchestrator.worker_counts();
    assert_eq!(counts.email_pollers, 1);
    assert_eq!(counts.calendar_pollers, 2);

    harness.orchestrator.shutdown();
    assert_eq!(harness.orchestrator.worker_counts().calendar_pollers, 0);
    Ok(())
}
