use std::time::Duration;

use cansdo_client::{RawAbortCode, SdoClientConfig, SdoClientError};
use cansdo_common::{
    messages::{sdo_request_id, sdo_response_id},
    sdo::{AbortCode, SdoRequest, SdoResponse},
    traits::AsyncCanSender,
    CanMessage,
};
use futures::executor::block_on;

mod utils;
use utils::{drain, pattern, setup_single_node, test_with_background_process, BusLogger, SLAVE_NODE_ID};

fn requests(messages: &[CanMessage]) -> Vec<SdoRequest> {
    messages
        .iter()
        .filter(|msg| msg.id() == sdo_request_id(SLAVE_NODE_ID))
        .map(|msg| SdoRequest::try_from(msg.data()).unwrap())
        .collect()
}

fn responses(messages: &[CanMessage]) -> Vec<SdoResponse> {
    messages
        .iter()
        .filter(|msg| msg.id() == sdo_response_id(SLAVE_NODE_ID))
        .map(|msg| SdoResponse::try_from(msg.data()).unwrap())
        .collect()
}

fn block_config() -> SdoClientConfig {
    SdoClientConfig {
        prefer_block: true,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_expedited_transfers() {
    let (mut node, od, mut client, bus) = setup_single_node(SdoClientConfig::default());
    let mut sender = bus.new_sender();
    let _logger = BusLogger::new(bus.new_receiver());

    test_with_background_process(&mut [&mut node], &mut sender, async {
        client.download_u32(0x1234, 1, 0xAABBCCDD).await.unwrap();
        assert_eq!(Some(vec![0xDD, 0xCC, 0xBB, 0xAA]), od.get(0x1234, 1));
        assert_eq!(0xAABBCCDD, client.upload_u32(0x1234, 1).await.unwrap());
        assert_eq!(0x191, client.upload_u32(0x1000, 0).await.unwrap());
        assert_eq!(
            Err(SdoClientError::SizeMismatch),
            client.upload_u16(0x1000, 0).await
        );
    })
    .await;
}

#[tokio::test]
async fn test_segmented_upload() {
    let (mut node, _od, mut client, bus) = setup_single_node(SdoClientConfig::default());
    let mut sender = bus.new_sender();
    let mut monitor = bus.new_receiver();

    let data = test_with_background_process(&mut [&mut node], &mut sender, async {
        client.upload(0x2000, 0).await.unwrap()
    })
    .await;
    assert_eq!(Vec::from_iter(0..20u8), data);

    let messages = drain(&mut monitor);
    let segments: Vec<(bool, usize)> = responses(&messages)
        .into_iter()
        .filter_map(|resp| match resp {
            SdoResponse::UploadSegment { t, n, .. } => Some((t, 7 - n as usize)),
            _ => None,
        })
        .collect();
    assert_eq!(vec![(false, 7), (true, 7), (false, 6)], segments);
}

#[tokio::test]
async fn test_segmented_download() {
    let (mut node, od, mut client, bus) = setup_single_node(SdoClientConfig::default());
    let mut sender = bus.new_sender();
    let _logger = BusLogger::new(bus.new_receiver());

    test_with_background_process(&mut [&mut node], &mut sender, async {
        let value = b"Hello, cansdo world";
        client.download(0x2001, 0, value).await.unwrap();
        assert_eq!(Some(value.to_vec()), od.get(0x2001, 0));
        assert_eq!(value.to_vec(), client.upload(0x2001, 0).await.unwrap());

        // An empty value is a valid segmented transfer
        client.download(0x2001, 0, &[]).await.unwrap();
        assert_eq!(Some(vec![]), od.get(0x2001, 0));
        assert_eq!(Vec::<u8>::new(), client.upload(0x2001, 0).await.unwrap());
    })
    .await;
}

#[tokio::test]
async fn test_block_download() {
    let (mut node, od, mut client, bus) = setup_single_node(block_config());
    let mut sender = bus.new_sender();
    let _logger = BusLogger::new(bus.new_receiver());

    test_with_background_process(&mut [&mut node], &mut sender, async {
        let data = Vec::from_iter(0..128u8);
        client.download(0x2001, 0, &data).await.unwrap();
        assert_eq!(Some(data), od.get(0x2001, 0));

        // Now do a long one which will require multiple sub-blocks
        let data = pattern(2000);
        client.download(0x2001, 0, &data).await.unwrap();
        assert_eq!(Some(data), od.get(0x2001, 0));

        // Short values still go expedited
        client.download(0x2002, 0, b"abc").await.unwrap();
        assert_eq!(Some(b"abc".to_vec()), od.get(0x2002, 0));
    })
    .await;
}

#[tokio::test]
async fn test_block_upload() {
    let config = SdoClientConfig {
        block_size: 16,
        ..block_config()
    };
    let (mut node, _od, mut client, bus) = setup_single_node(config);
    let mut sender = bus.new_sender();
    let mut monitor = bus.new_receiver();

    test_with_background_process(&mut [&mut node], &mut sender, async {
        assert_eq!(Vec::from_iter(0..20u8), client.upload(0x2000, 0).await.unwrap());
        assert_eq!(pattern(1000), client.upload(0x2003, 0).await.unwrap());
    })
    .await;

    // 1000 bytes is 143 segments, which takes 9 sub-blocks of 16
    let acks = requests(&drain(&mut monitor))
        .into_iter()
        .filter(|req| matches!(req, SdoRequest::ConfirmBlock { .. }))
        .count();
    assert_eq!(1 + 9, acks);
}

#[tokio::test]
async fn test_block_upload_protocol_switch() {
    let config = SdoClientConfig {
        pst: 30,
        ..block_config()
    };
    let (mut node, _od, mut client, bus) = setup_single_node(config);
    let mut sender = bus.new_sender();
    let mut monitor = bus.new_receiver();

    test_with_background_process(&mut [&mut node], &mut sender, async {
        assert_eq!(Vec::from_iter(0..20u8), client.upload(0x2000, 0).await.unwrap());
    })
    .await;

    let responses = responses(&drain(&mut monitor));
    assert!(matches!(
        responses[0],
        SdoResponse::ConfirmUpload { e: false, s: true, .. }
    ));
    assert_eq!(4, responses.len());
}

#[tokio::test]
async fn test_block_upload_crc_failure() {
    let (mut node, _od, mut client, bus) = setup_single_node(block_config());
    let mut sender = bus.new_sender();
    let _logger = BusLogger::new(bus.new_receiver());

    // Corrupt the second segment of the first sub-block on its way to the client
    let mut corrupted = false;
    bus.set_filter(move |mut msg| {
        if !corrupted && msg.id() == sdo_response_id(SLAVE_NODE_ID) && msg.data[0] == 2 {
            msg.data[3] ^= 0xff;
            corrupted = true;
        }
        Some(msg)
    });

    test_with_background_process(&mut [&mut node], &mut sender, async {
        assert_eq!(
            Err(SdoClientError::CrcMismatch),
            client.upload(0x2003, 0).await
        );

        // The abort released the server
        bus.clear_filter();
        assert_eq!(pattern(1000), client.upload(0x2003, 0).await.unwrap());
    })
    .await;
}

#[tokio::test]
async fn test_server_abort() {
    let (mut node, od, mut client, bus) = setup_single_node(SdoClientConfig::default());
    let mut sender = bus.new_sender();
    let _logger = BusLogger::new(bus.new_receiver());

    test_with_background_process(&mut [&mut node], &mut sender, async {
        assert_eq!(
            Err(SdoClientError::ServerAbort {
                index: 0x5000,
                sub: 0,
                abort_code: RawAbortCode::Valid(AbortCode::NoSuchObject)
            }),
            client.upload(0x5000, 0).await
        );
        assert_eq!(
            Err(SdoClientError::ServerAbort {
                index: 0x2000,
                sub: 0,
                abort_code: RawAbortCode::Valid(AbortCode::ReadOnly)
            }),
            client.download(0x2000, 0, &[1, 2, 3, 4, 5, 6, 7, 8]).await
        );
        assert_eq!(
            Err(SdoClientError::ServerAbort {
                index: 0x1234,
                sub: 1,
                abort_code: RawAbortCode::Valid(AbortCode::DataTypeMismatchLengthLow)
            }),
            client.download(0x1234, 1, &[1, 2]).await
        );
        // A too long value is refused at initiate, and the old value is kept
        client.download(0x2001, 0, b"keep").await.unwrap();
        let res = client.download(0x2001, 0, &pattern(5000)).await;
        assert!(matches!(res, Err(SdoClientError::ServerAbort { .. })));
        assert_eq!(Some(b"keep".to_vec()), od.get(0x2001, 0));
    })
    .await;
}

#[tokio::test]
async fn test_client_retry() {
    let (mut node, _od, mut client, bus) = setup_single_node(SdoClientConfig::default());
    let mut sender = bus.new_sender();
    let mut monitor = bus.new_receiver();

    // Lose the initiate response and the second segment once each
    let mut seen = 0;
    bus.set_filter(move |msg| {
        if msg.id() == sdo_response_id(SLAVE_NODE_ID) {
            seen += 1;
            if seen == 1 || seen == 4 {
                return None;
            }
        }
        Some(msg)
    });

    let data = test_with_background_process(&mut [&mut node], &mut sender, async {
        client.upload(0x2000, 0).await.unwrap()
    })
    .await;
    assert_eq!(Vec::from_iter(0..20u8), data);

    let requests = requests(&drain(&mut monitor));
    let initiates = requests
        .iter()
        .filter(|req| matches!(req, SdoRequest::InitiateUpload { .. }))
        .count();
    assert_eq!(2, initiates);
    assert_eq!(2 + 4, requests.len());
}

#[tokio::test]
async fn test_retry_budget_covers_whole_transfer() {
    let (mut node, _od, mut client, bus) = setup_single_node(SdoClientConfig {
        timeout_ms: 20,
        ..Default::default()
    });
    let mut sender = bus.new_sender();
    let mut monitor = bus.new_receiver();

    // Lose one response at each of three different steps
    let mut seen = 0;
    bus.set_filter(move |msg| {
        if msg.id() == sdo_response_id(SLAVE_NODE_ID) {
            seen += 1;
            if seen % 2 == 1 && seen <= 5 {
                return None;
            }
        }
        Some(msg)
    });

    let res = test_with_background_process(&mut [&mut node], &mut sender, async {
        client.upload(0x2000, 0).await
    })
    .await;
    assert_eq!(Err(SdoClientError::NoResponse), res);

    let requests = requests(&drain(&mut monitor));
    assert_eq!(
        Some(&SdoRequest::abort(0x2000, 0, AbortCode::SdoTimeout)),
        requests.last()
    );
}

#[tokio::test]
async fn test_no_response() {
    // The node is never processed, so nothing answers
    let (_node, _od, mut client, bus) = setup_single_node(SdoClientConfig {
        retries: 2,
        timeout_ms: 10,
        ..Default::default()
    });
    let mut monitor = bus.new_receiver();

    assert_eq!(Err(SdoClientError::NoResponse), client.upload(0x2000, 0).await);

    let requests = requests(&drain(&mut monitor));
    assert_eq!(
        vec![
            SdoRequest::initiate_upload(0x2000, 0),
            SdoRequest::initiate_upload(0x2000, 0),
            SdoRequest::abort(0x2000, 0, AbortCode::SdoTimeout),
        ],
        requests
    );
}

#[tokio::test]
async fn test_cancellation() {
    let (_node, _od, mut client, bus) = setup_single_node(SdoClientConfig::default());
    let mut monitor = bus.new_receiver();

    let deadline = tokio::time::Instant::now() + Duration::from_millis(5);
    assert_eq!(
        Err(SdoClientError::Cancelled),
        client.download_until(0x2001, 0, &pattern(100), deadline).await
    );
    let requests = requests(&drain(&mut monitor));
    assert_eq!(
        Some(&SdoRequest::abort(0x2001, 0, AbortCode::GeneralError)),
        requests.last()
    );

    // The client is idle again
    let deadline = tokio::time::Instant::now() + Duration::from_millis(5);
    assert_eq!(
        Err(SdoClientError::Cancelled),
        client.upload_until(0x2000, 0, deadline).await
    );
}

#[test]
fn test_busy_server() {
    let (mut node, od, _client, bus) = setup_single_node(SdoClientConfig::default());
    let mut sender = bus.new_sender();
    let mut monitor = bus.new_receiver();
    let mut raw = bus.new_sender();
    let mut request = |req: SdoRequest| {
        block_on(raw.send(CanMessage::new(sdo_request_id(SLAVE_NODE_ID), req.to_bytes()))).unwrap()
    };
    let mut process = |time_us| {
        node.process(time_us, &mut |msg| block_on(sender.send(msg)).unwrap());
        responses(&drain(&mut monitor))
    };
    process(0);

    let value = b"fourteen bytes";
    request(SdoRequest::initiate_download(0x2001, 0, Some(14)));
    assert_eq!(vec![SdoResponse::download_acknowledge(0x2001, 0)], process(100));
    request(SdoRequest::download_segment(false, false, &value[..7]));
    assert_eq!(vec![SdoResponse::download_segment_acknowledge(false)], process(200));

    // A second client tries to start a transfer
    request(SdoRequest::initiate_upload(0x2000, 0));
    assert_eq!(
        vec![SdoResponse::abort(0x2000, 0, AbortCode::ResourceNotAvailable)],
        process(300)
    );

    // The first transfer carries on undisturbed
    request(SdoRequest::download_segment(true, true, &value[7..]));
    assert_eq!(vec![SdoResponse::download_segment_acknowledge(true)], process(400));
    assert_eq!(Some(value.to_vec()), od.get(0x2001, 0));
}

#[test]
fn test_server_timeout() {
    let (mut node, od, _client, bus) = setup_single_node(SdoClientConfig::default());
    let mut sender = bus.new_sender();
    let mut monitor = bus.new_receiver();
    let mut raw = bus.new_sender();
    let mut process = |time_us| {
        node.process(time_us, &mut |msg| block_on(sender.send(msg)).unwrap());
        responses(&drain(&mut monitor))
    };
    process(0);

    block_on(raw.send(CanMessage::new(
        sdo_request_id(SLAVE_NODE_ID),
        SdoRequest::initiate_download(0x2001, 0, Some(10)).to_bytes(),
    )))
    .unwrap();
    assert_eq!(1, process(1_000).len());
    // Still within the timeout
    assert!(process(150_000).is_empty());
    assert_eq!(
        vec![SdoResponse::abort(0x2001, 0, AbortCode::SdoTimeout)],
        process(210_000)
    );
    assert_eq!(Some(vec![]), od.get(0x2001, 0));
}
