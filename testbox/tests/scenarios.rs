//! End-to-end exchanges with literal bytes, driven through a `DeviceChannel`
//! over the mock transport.

use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use testbox::{
    bitfield::BitField,
    channel::{Channel, DeviceChannel, SendOptions},
    dispatcher::{QueueKind, WhenBusy},
    error::{Diagnostic, Error, HidppError, Result},
    feature::{
        FeatureModel,
        FeatureRegistry,
        device_friendly_name::{self, DeviceFriendlyNameFeature, FriendlyNameLength},
        root::RootFeature,
    },
    hexlist::HexList,
    protocol::{Message, Protocol, ReportType, hidpp, vlp},
    settings::Settings,
    transport::mock::MockTransport,
};

const WAIT: Duration = Duration::from_secs(1);

/// Parses `src` and pads it with zeroes to the length of its report type.
fn report(src: &str) -> HexList {
    let mut report = HexList::from_hex(src).expect("valid hex");
    let len = ReportType::from_report_id(report[0]).map_or(report.len(), ReportType::length);
    report.pad_right(len, 0);
    report
}

fn open_channel(
    transport: &MockTransport,
    registry: FeatureRegistry,
) -> Result<Arc<dyn Channel>> {
    let chan: Arc<dyn Channel> = Arc::new(DeviceChannel::new(
        transport.clone(),
        0x01,
        Arc::new(registry),
        &Settings::default(),
    ));
    chan.open()?;

    Ok(chan)
}

/// Answers `Root.GetFeature(0x0007)` with index 4 and the friendly name
/// length request with the recorded response.
fn friendly_name_device(transport: &MockTransport) {
    transport.respond_with(|written| match written {
        [0x11, 0x01, 0x00, 0x0f, 0x00, 0x07, ..] => vec![report("1101000F0400")],
        [0x10, 0x01, 0x04, 0x01, ..] => vec![report("10010401030E00")],
        [0x10, 0x01, 0x04, 0x51, ..] => vec![report("10018F04510700")],
        _ => Vec::new(),
    });
}

#[test]
fn root_get_feature_then_friendly_name_length() -> Result<()> {
    let transport = MockTransport::new();
    friendly_name_device(&transport);
    let chan = open_channel(&transport, FeatureRegistry::with_defaults()?)?;

    let info = RootFeature::new(Arc::clone(&chan))?
        .get_feature(device_friendly_name::ID)?
        .ok_or(Error::FeatureNotSupported(device_friendly_name::ID))?;
    assert_eq!(info.index, 0x04);
    assert_eq!(u8::from(info.typ), 0);
    assert_eq!(info.version, 0);

    let friendly_name = DeviceFriendlyNameFeature::resolve(&chan)?;
    assert_eq!(friendly_name.get_friendly_name_len()?, FriendlyNameLength {
        name_len: 3,
        name_max_len: 14,
        default_name_len: 0,
    });

    assert_eq!(transport.write_history(), vec![
        report("1101000F0007"),
        report("10010401000000"),
    ]);
    Ok(())
}

#[test]
fn protocol_error_resolves_the_request() -> Result<()> {
    let transport = MockTransport::new();
    friendly_name_device(&transport);
    let chan = open_channel(&transport, FeatureRegistry::with_defaults()?)?;
    let info = RootFeature::new(Arc::clone(&chan))?
        .get_feature(device_friendly_name::ID)?
        .ok_or(Error::FeatureNotSupported(device_friendly_name::ID))?;

    // DeviceFriendlyName v0 has no function 5.
    let id = device_friendly_name::ID;
    let request = hidpp::request("Unsupported", id, 5, 0, ReportType::Short, vec![])?;
    let response = hidpp::response("UnsupportedResponse", id, 5, 0, ReportType::Short, vec![])?;
    let mut message = Message::new(&request);
    message.set_device_index(chan.device_index())?;
    message.set_feature_index(info.index)?;

    assert_eq!(
        chan.send_report_wait_response(message, &response, WAIT),
        Err(Error::Hidpp(HidppError {
            feature_index: 0x04,
            function_index: 5,
            software_id: 1,
            error_code: 7,
        }))
    );
    assert_eq!(
        transport.write_history().last(),
        Some(&report("10010451000000"))
    );

    let error = chan.dispatcher().queue(QueueKind::Error).get(WAIT)?;
    assert_eq!(
        error.message.as_error().map(|error| error.report.clone()),
        Some(report("10018F04510700"))
    );
    assert!(chan.dispatcher().pending().is_empty());
    Ok(())
}

#[test]
fn events_fan_out_to_event_and_category_queues() -> Result<()> {
    let event = hidpp::event("StatusBroadcast", 0x1d4b, 0, 0, ReportType::Long, vec![
        BitField::new(0xfa, "status", 8),
        BitField::new(0xf9, "request", 8),
        BitField::new(0xf8, "reason", 8),
    ])?;
    let model = FeatureModel::builder(0x1d4b, "WirelessDeviceStatus", 0, Protocol::Hidpp)
        .event(event)?
        .build();
    let registry = FeatureRegistry::builder()
        .register_defaults()?
        .register(model)?
        .build();

    let transport = MockTransport::new();
    let chan = open_channel(&transport, registry)?;
    chan.dispatcher().feature_table().insert(0x04, 0x1d4b, 0);

    transport.queue_read(report("11010400AABBCC"));

    let dispatcher = chan.dispatcher();
    let event = dispatcher.queue(QueueKind::Event).get(WAIT)?;
    let parsed = event
        .message
        .as_message()
        .ok_or(Error::UnexpectedResponse("not a message".to_string()))?;
    assert_eq!(parsed.class().name(), "StatusBroadcast");
    assert_eq!(parsed.get_int("status")?, 0xaa);
    assert_eq!(parsed.get_int("request")?, 0xbb);
    assert_eq!(parsed.get_int("reason")?, 0xcc);

    let category = dispatcher.queue(QueueKind::Peripheral).get(WAIT)?;
    assert_eq!(category.message, event.message);
    assert_eq!(category.timestamp_ns, event.timestamp_ns);
    assert!(dispatcher.queue(QueueKind::Raw).is_empty());
    Ok(())
}

#[test]
fn timeout_frees_the_software_id() -> Result<()> {
    let transport = MockTransport::new();
    let chan = open_channel(&transport, FeatureRegistry::with_defaults()?)?;
    let dispatcher = chan.dispatcher();

    let model = dispatcher
        .registry()
        .lookup(Protocol::Hidpp, device_friendly_name::ID, 0)
        .cloned()
        .ok_or(Error::FeatureNotSupported(device_friendly_name::ID))?;
    let function = model
        .function(0)
        .cloned()
        .ok_or(Error::FeatureNotSupported(device_friendly_name::ID))?;
    let mut request = Message::new(&function.request);
    request.set_device_index(chan.device_index())?;
    request.set_feature_index(0x04)?;

    let timeout = Duration::from_millis(100);
    let started = Instant::now();
    assert_eq!(
        chan.send_report_wait_response(request, &function.response, timeout),
        Err(Error::Timeout)
    );
    let elapsed = started.elapsed();
    assert!(elapsed >= timeout, "returned after {elapsed:?}");
    assert!(elapsed < timeout * 10, "returned after {elapsed:?}");
    assert!(dispatcher.pending().software_ids_in_use().is_empty());

    // The late answer is reported as an orphan.
    transport.queue_read(report("1001040F030E00"));
    let orphan = dispatcher.queue(QueueKind::Raw).get(WAIT)?;
    assert_eq!(orphan.message.diagnostic(), Some(Diagnostic::Orphan));
    Ok(())
}

#[test]
fn vlp_frames_reassemble_into_one_message() -> Result<()> {
    let transport = MockTransport::new();
    let chan = open_channel(&transport, FeatureRegistry::with_defaults()?)?;
    let payload = (0..140u8).collect::<Vec<_>>();

    for (flags, sequence, chunk) in [
        (vlp::BEGIN, 0, &payload[..60]),
        (0, 1, &payload[60..120]),
        (vlp::END, 2, &payload[120..]),
    ] {
        let header = HexList::from([0x13, 0x01, 0x00, flags, sequence]);
        transport.queue_read(header + HexList::from(chunk));
    }

    let dispatcher = chan.dispatcher();
    let entry = dispatcher.queue(QueueKind::Vlp).get(WAIT)?;
    let message = entry
        .message
        .as_message()
        .ok_or(Error::UnexpectedResponse("not a message".to_string()))?;

    // Parsed as the VLP Root answer: 7 octets of fields, the rest padding.
    assert_eq!(message.get_int("feature_id")?, 0x0001);
    assert_eq!(message.get_int("feat_index")?, 0x02);
    assert_eq!(message.get_int("feature_max_memory")?, 0x0506);
    assert_eq!(message.get("padding")?.as_bytes(), &payload[7..]);
    assert_eq!(message.function_index(), 0);

    assert!(dispatcher.queue(QueueKind::Vlp).is_empty());
    assert!(dispatcher.queue(QueueKind::Raw).is_empty());
    Ok(())
}

#[test]
fn concurrent_requests_get_their_own_responses() -> Result<()> {
    const CALLERS: u8 = 40;

    let transport = MockTransport::new();
    // Echo every request back as its response.
    transport.respond_with(|written| match written {
        [0x10, 0x01, 0x04, ..] => vec![HexList::from(written.to_vec())],
        _ => Vec::new(),
    });
    let chan = open_channel(&transport, FeatureRegistry::with_defaults()?)?;

    let id = device_friendly_name::ID;
    let token = || vec![BitField::new(0xfa, "token", 8)];
    let request = hidpp::request("Echo", id, 2, 0, ReportType::Short, token())?;
    let response = hidpp::response("EchoResponse", id, 2, 0, ReportType::Short, token())?;
    let options = SendOptions {
        timeout: WAIT * 5,
        when_busy: WhenBusy::Wait(WAIT * 5),
    };

    thread::scope(|scope| {
        let callers = (0..CALLERS)
            .map(|caller| {
                let (chan, request, response) = (&chan, &request, &response);
                scope.spawn(move || -> Result<(u8, u128)> {
                    let mut message = Message::new(request);
                    message.set_device_index(chan.device_index())?;
                    message.set_feature_index(0x04)?;
                    message.set("token", caller)?;

                    let answer = chan.send_report_wait_response_with(message, response, options)?;
                    Ok((caller, answer.get_int("token")?))
                })
            })
            .collect::<Vec<_>>();

        for caller in callers {
            let (sent, received) = caller.join().expect("caller panicked")?;
            assert_eq!(received, u128::from(sent));
        }
        Ok::<_, Error>(())
    })?;

    let history = transport.write_history();
    assert_eq!(history.len(), usize::from(CALLERS));
    assert!(history.iter().all(|report| (1..=15).contains(&(report[3] & 0x0f))));
    assert!(chan.dispatcher().pending().is_empty());
    assert!(chan.dispatcher().queue(QueueKind::Raw).is_empty());
    Ok(())
}
