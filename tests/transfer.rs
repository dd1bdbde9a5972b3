mod common;

use common::*;
use futures::io::Cursor;
use std::time::Duration;
use wormhole_engine::{
    FailureKind, SendFile, SessionState, TransferEvent, begin_receive, begin_send,
};

const SIZE: usize = 204800;

/// Nothing in here should take anywhere near that long
async fn bounded<T>(test: impl std::future::Future<Output = T>) -> T {
    async_std::future::timeout(Duration::from_secs(60), test)
        .await
        .expect("Test timed out")
}

fn failure_kind(events: &[TransferEvent]) -> Option<FailureKind> {
    match events.last() {
        Some(TransferEvent::Failed(error)) => Some(error.kind()),
        _ => None,
    }
}

#[test_log::test(async_std::test)]
pub async fn test_file_transfer_over_relay() -> eyre::Result<()> {
    let mailbox = start_mailbox_server(7).await;
    let relay = start_relay(None).await;
    let config = test_config(&mailbox, &relay);
    let data = test_data(SIZE);
    let dir = temp_dir();

    bounded(async {
        let file = SendFile::from_reader(Cursor::new(data.clone()), "report.pdf", SIZE as u64)
            .kind("application/pdf");
        let (_send_handle, send_events) = begin_send(config.clone(), file);
        let mut sent = Vec::new();
        let code = wait_for_code(&send_events, &mut sent).await;
        assert!(code.to_string().starts_with("7-"), "{}", code);
        assert_eq!(code.words().len(), 2);

        let (receive_handle, receive_events) = begin_receive(config, &code.to_string(), &dir)?;
        let (sent, received) = futures::join!(
            collect(send_events, sent),
            drive_receiver(receive_handle, receive_events, true)
        );

        let offer = received
            .iter()
            .find_map(|event| match event {
                TransferEvent::OfferReceived(offer) => Some(offer.clone()),
                _ => None,
            })
            .expect("No offer received");
        assert_eq!(offer.filename, "report.pdf");
        assert_eq!(offer.size, SIZE as u64);
        assert_eq!(offer.kind.as_deref(), Some("application/pdf"));

        assert!(verifier(&sent).is_some());
        assert_eq!(verifier(&sent), verifier(&received));

        assert!(matches!(sent.last(), Some(TransferEvent::Completed { path: None })), "{:?}", sent.last());
        assert!(sent.iter().any(|event| matches!(event, TransferEvent::OfferSent(_))));
        assert!(sent.iter().any(|event| matches!(
            event,
            TransferEvent::Progress { done, total } if *done == SIZE as u64 && *total == SIZE as u64
        )));
        for state in [
            SessionState::CodeAllocated,
            SessionState::PeerConnected,
            SessionState::KeyExchanged,
            SessionState::OfferSent,
            SessionState::OfferConfirmed,
            SessionState::Transferring,
            SessionState::Completed,
        ] {
            assert!(reached(&sent, state), "Sender never reached {}", state);
        }
        assert!(reached(&received, SessionState::OfferReceived));

        let Some(TransferEvent::Completed { path: Some(path) }) = received.last() else {
            panic!("Receiver did not complete: {:?}", received.last());
        };
        assert_eq!(path, &dir.join("report.pdf"));
        assert_eq!(std::fs::read(path)?, data);
        assert_eq!(dir_entries(&dir), vec!["report.pdf".to_string()]);
        eyre::Result::<()>::Ok(())
    })
    .await?;

    std::fs::remove_dir_all(&dir)?;
    Ok(())
}

#[test_log::test(async_std::test)]
pub async fn test_existing_part_file_is_kept() -> eyre::Result<()> {
    let mailbox = start_mailbox_server(7).await;
    let relay = start_relay(None).await;
    let config = test_config(&mailbox, &relay);
    let data = test_data(4096);
    let dir = temp_dir();
    std::fs::write(dir.join("report.pdf.part"), b"half of an older download")?;

    bounded(async {
        let file = SendFile::from_reader(Cursor::new(data.clone()), "report.pdf", data.len() as u64);
        let (_send_handle, send_events) = begin_send(config.clone(), file);
        let mut sent = Vec::new();
        let code = wait_for_code(&send_events, &mut sent).await;

        let (receive_handle, receive_events) = begin_receive(config, &code.to_string(), &dir)?;
        let (_sent, received) = futures::join!(
            collect(send_events, sent),
            drive_receiver(receive_handle, receive_events, true)
        );

        let Some(TransferEvent::Completed { path: Some(path) }) = received.last() else {
            panic!("Receiver did not complete: {:?}", received.last());
        };
        assert_eq!(std::fs::read(path)?, data);
        assert_eq!(
            std::fs::read(dir.join("report.pdf.part"))?,
            b"half of an older download"
        );
        assert_eq!(
            dir_entries(&dir),
            vec!["report.pdf".to_string(), "report.pdf.part".to_string()]
        );
        eyre::Result::<()>::Ok(())
    })
    .await?;

    std::fs::remove_dir_all(&dir)?;
    Ok(())
}

#[test_log::test(async_std::test)]
pub async fn test_rejected_offer() -> eyre::Result<()> {
    let mailbox = start_mailbox_server(7).await;
    let relay = start_relay(None).await;
    let config = test_config(&mailbox, &relay);
    let dir = temp_dir();

    bounded(async {
        let file = SendFile::from_reader(Cursor::new(test_data(SIZE)), "report.pdf", SIZE as u64);
        let (_send_handle, send_events) = begin_send(config.clone(), file);
        let mut sent = Vec::new();
        let code = wait_for_code(&send_events, &mut sent).await;

        let (receive_handle, receive_events) = begin_receive(config, &code.to_string(), &dir)?;
        let (sent, received) = futures::join!(
            collect(send_events, sent),
            drive_receiver(receive_handle, receive_events, false)
        );

        assert_eq!(failure_kind(&sent), Some(FailureKind::Rejected), "{:?}", sent.last());
        assert!(!reached(&sent, SessionState::Transferring));
        assert!(!sent.iter().any(|event| matches!(event, TransferEvent::TransitConnected(_))));

        assert!(matches!(received.last(), Some(TransferEvent::Cancelled)), "{:?}", received.last());
        assert!(dir_entries(&dir).is_empty());
        eyre::Result::<()>::Ok(())
    })
    .await?;

    std::fs::remove_dir_all(&dir)?;
    Ok(())
}

#[test_log::test(async_std::test)]
pub async fn test_wrong_code() -> eyre::Result<()> {
    let mailbox = start_mailbox_server(7).await;
    let relay = start_relay(None).await;
    let config = test_config(&mailbox, &relay);
    let dir = temp_dir();

    bounded(async {
        let file = SendFile::from_reader(Cursor::new(test_data(1024)), "notes.txt", 1024);
        let (_send_handle, send_events) = begin_send(config.clone(), file);
        let mut sent = Vec::new();
        let code = wait_for_code(&send_events, &mut sent).await;

        /* Same nameplate, different password */
        let words = code.words();
        let first = if words[0] == "adroitness" { "crossover" } else { "adroitness" };
        let wrong = format!("{}-{}-{}", code.nameplate(), first, words[1]);

        let (receive_handle, receive_events) = begin_receive(config, &wrong, &dir)?;
        let (sent, received) = futures::join!(
            collect(send_events, sent),
            drive_receiver(receive_handle, receive_events, true)
        );

        assert_eq!(failure_kind(&sent), Some(FailureKind::WrongCode), "{:?}", sent.last());
        assert_eq!(failure_kind(&received), Some(FailureKind::WrongCode), "{:?}", received.last());
        assert!(!reached(&received, SessionState::KeyExchanged));
        assert!(!received.iter().any(|event| matches!(event, TransferEvent::OfferReceived(_))));
        eyre::Result::<()>::Ok(())
    })
    .await?;

    std::fs::remove_dir_all(&dir)?;
    Ok(())
}

#[test_log::test(async_std::test)]
pub async fn test_corrupted_record() -> eyre::Result<()> {
    let mailbox = start_mailbox_server(7).await;
    /* Lands inside the ciphertext of the first record */
    let relay = start_relay(Some(5000)).await;
    let config = test_config(&mailbox, &relay);
    let dir = temp_dir();

    bounded(async {
        let file = SendFile::from_reader(Cursor::new(test_data(SIZE)), "report.pdf", SIZE as u64);
        let (_send_handle, send_events) = begin_send(config.clone(), file);
        let mut sent = Vec::new();
        let code = wait_for_code(&send_events, &mut sent).await;

        let (receive_handle, receive_events) = begin_receive(config, &code.to_string(), &dir)?;
        let (sent, received) = futures::join!(
            collect(send_events, sent),
            drive_receiver(receive_handle, receive_events, true)
        );

        assert_eq!(
            failure_kind(&received),
            Some(FailureKind::FileCorrupted),
            "{:?}",
            received.last()
        );
        assert!(!received.iter().any(|event| matches!(event, TransferEvent::Completed { .. })));
        assert!(matches!(sent.last(), Some(TransferEvent::Failed(_))), "{:?}", sent.last());
        /* Neither the final file nor the partial one survive */
        assert!(dir_entries(&dir).is_empty(), "{:?}", dir_entries(&dir));
        eyre::Result::<()>::Ok(())
    })
    .await?;

    std::fs::remove_dir_all(&dir)?;
    Ok(())
}

#[test_log::test(async_std::test)]
pub async fn test_concurrent_sessions() -> eyre::Result<()> {
    let mailbox = start_mailbox_server(7).await;
    let relay = start_relay(None).await;
    let config = test_config(&mailbox, &relay);
    let dir_a = temp_dir();
    let dir_b = temp_dir();
    let data_a = test_data(SIZE);
    let data_b: Vec<u8> = test_data(SIZE / 2).into_iter().rev().collect();

    bounded(async {
        let (_handle_a, events_a) = begin_send(
            config.clone(),
            SendFile::from_reader(Cursor::new(data_a.clone()), "a.bin", data_a.len() as u64),
        );
        let (_handle_b, events_b) = begin_send(
            config.clone(),
            SendFile::from_reader(Cursor::new(data_b.clone()), "b.bin", data_b.len() as u64),
        );
        let (mut sent_a, mut sent_b) = (Vec::new(), Vec::new());
        let code_a = wait_for_code(&events_a, &mut sent_a).await;
        let code_b = wait_for_code(&events_b, &mut sent_b).await;
        assert_ne!(code_a.nameplate(), code_b.nameplate());

        let (receive_a, receive_events_a) = begin_receive(config.clone(), &code_a.to_string(), &dir_a)?;
        let (receive_b, receive_events_b) = begin_receive(config, &code_b.to_string(), &dir_b)?;

        let (sent_a, sent_b, received_a, received_b) = futures::join!(
            collect(events_a, sent_a),
            collect(events_b, sent_b),
            drive_receiver(receive_a, receive_events_a, true),
            drive_receiver(receive_b, receive_events_b, true),
        );

        for events in [&sent_a, &sent_b, &received_a, &received_b] {
            assert!(matches!(events.last(), Some(TransferEvent::Completed { .. })), "{:?}", events.last());
        }
        assert_ne!(verifier(&received_a), verifier(&received_b));
        assert_eq!(std::fs::read(dir_a.join("a.bin"))?, data_a);
        assert_eq!(std::fs::read(dir_b.join("b.bin"))?, data_b);
        eyre::Result::<()>::Ok(())
    })
    .await?;

    std::fs::remove_dir_all(&dir_a)?;
    std::fs::remove_dir_all(&dir_b)?;
    Ok(())
}

#[test_log::test(async_std::test)]
pub async fn test_sender_cancels_midway() -> eyre::Result<()> {
    let mailbox = start_mailbox_server(7).await;
    let relay = start_relay(None).await;
    let chunk = 16 * 1024;
    let config = test_config(&mailbox, &relay).chunk_size(chunk);
    let dir = temp_dir();

    bounded(async {
        /* Seven full chunks go out, then the source hangs */
        let reader = StallingReader::new(test_data(SIZE), 7 * chunk);
        let (send_handle, send_events) =
            begin_send(config.clone(), SendFile::from_reader(reader, "report.pdf", SIZE as u64));
        let mut sent = Vec::new();
        let code = wait_for_code(&send_events, &mut sent).await;

        let (receive_handle, receive_events) = begin_receive(config, &code.to_string(), &dir)?;
        let receiver = async_std::task::spawn(drive_receiver(receive_handle, receive_events, true));

        while let Ok(event) = send_events.recv().await {
            let halfway = matches!(
                event,
                TransferEvent::Progress { done, total } if done * 2 >= total
            );
            sent.push(event);
            if halfway {
                send_handle.cancel();
            }
        }
        let received = receiver.await;

        assert!(matches!(sent.last(), Some(TransferEvent::Cancelled)), "{:?}", sent.last());
        assert!(matches!(received.last(), Some(TransferEvent::Cancelled)), "{:?}", received.last());
        assert!(reached(&received, SessionState::Transferring));
        assert!(!received.iter().any(|event| matches!(event, TransferEvent::Completed { .. })));
        assert!(dir_entries(&dir).is_empty(), "{:?}", dir_entries(&dir));
        eyre::Result::<()>::Ok(())
    })
    .await?;

    std::fs::remove_dir_all(&dir)?;
    Ok(())
}

#[test_log::test(async_std::test)]
pub async fn test_receiver_cancels_before_answering() -> eyre::Result<()> {
    let mailbox = start_mailbox_server(7).await;
    let relay = start_relay(None).await;
    let config = test_config(&mailbox, &relay);
    let dir = temp_dir();

    bounded(async {
        let file = SendFile::from_reader(Cursor::new(test_data(1024)), "notes.txt", 1024);
        let (_send_handle, send_events) = begin_send(config.clone(), file);
        let mut sent = Vec::new();
        let code = wait_for_code(&send_events, &mut sent).await;

        let (receive_handle, receive_events) = begin_receive(config, &code.to_string(), &dir)?;
        let mut received = Vec::new();
        while let Ok(event) = receive_events.recv().await {
            if let TransferEvent::OfferReceived(_) = &event {
                receive_handle.cancel();
            }
            received.push(event);
        }
        let sent = collect(send_events, sent).await;

        assert!(matches!(received.last(), Some(TransferEvent::Cancelled)), "{:?}", received.last());
        assert!(matches!(sent.last(), Some(TransferEvent::Cancelled)), "{:?}", sent.last());
        assert!(!reached(&sent, SessionState::Transferring));
        eyre::Result::<()>::Ok(())
    })
    .await?;

    std::fs::remove_dir_all(&dir)?;
    Ok(())
}

#[test_log::test(async_std::test)]
pub async fn test_unreachable_mailbox() -> eyre::Result<()> {
    /* Nothing listens there once the listener is gone */
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        listener.local_addr()?.port()
    };
    let url = format!("tcp://127.0.0.1:{}", port);
    let config = test_config(&url, &url);

    bounded(async {
        let file = SendFile::from_reader(Cursor::new(test_data(16)), "notes.txt", 16);
        let (_send_handle, send_events) = begin_send(config, file);
        let sent = collect(send_events, Vec::new()).await;
        assert_eq!(failure_kind(&sent), Some(FailureKind::ConnectionFailed), "{:?}", sent.last());
        assert!(!sent.iter().any(|event| matches!(event, TransferEvent::Code(_))));
    })
    .await;
    Ok(())
}
