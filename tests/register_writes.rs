use flexbridge_lib::device::{Page, RegisterDevice};
use flexbridge_lib::mock::{simulated_session, SimulatedBusPirate};

/// Split the host's byte stream for one register write back into bulk payloads.
fn bulk_payloads(written: &[u8]) -> Vec<Vec<u8>> {
    assert_eq!(written.first(), Some(&0x02), "write must open with a start bit");
    assert_eq!(written.last(), Some(&0x03), "write must end with a stop bit");

    let body = &written[1..written.len() - 1];
    let mut payloads = Vec::new();
    let mut pos = 0;
    while pos < body.len() {
        let header = body[pos];
        assert_eq!(header & 0xF0, 0x10, "expected a bulk header at {}", pos);
        let len = (header & 0x0F) as usize + 1;
        payloads.push(body[pos + 1..pos + 1 + len].to_vec());
        pos += 1 + len;
    }
    payloads
}

#[test]
fn test_write_is_split_into_ordered_chunks() {
    let sim = SimulatedBusPirate::new();
    let mut session = simulated_session(&sim).unwrap();
    let mut device = RegisterDevice::new(&mut session, 0x52);
    device.set_page(Page::Led).unwrap();

    for data_len in [1usize, 14, 30, 31, 62] {
        sim.clear_written();
        let data: Vec<u8> = (0..data_len).map(|i| i as u8).collect();
        device.write(3, &data).unwrap();

        let frame_len = data_len + 2;
        let payloads = bulk_payloads(&sim.written());
        assert_eq!(payloads.len(), (frame_len + 15) / 16, "chunk count for {} bytes", data_len);
        assert!(payloads[..payloads.len() - 1].iter().all(|p| p.len() == 16));

        let mut expected = vec![0x52, 3];
        expected.extend_from_slice(&data);
        assert_eq!(payloads.concat(), expected);
        assert_eq!(&sim.page_contents(2)[3..3 + data_len], data.as_slice());
    }
}

#[test]
fn test_smaller_chunk_size_is_honoured() {
    let sim = SimulatedBusPirate::new();
    let mut session = simulated_session(&sim).unwrap();
    let mut device = RegisterDevice::new(&mut session, 0x52).with_chunk_size(8).unwrap();
    device.set_page(Page::Led).unwrap();

    sim.clear_written();
    device.write(0, &[0xAA; 8]).unwrap();
    assert_eq!(sim.bulk_headers(), vec![0x17, 0x11]);
}

#[test]
fn test_invalid_chunk_size_is_rejected() {
    let sim = SimulatedBusPirate::new();
    let mut session = simulated_session(&sim).unwrap();
    assert!(RegisterDevice::new(&mut session, 0x52).with_chunk_size(0).is_err());
    assert!(RegisterDevice::new(&mut session, 0x52).with_chunk_size(17).is_err());
}

#[test]
fn test_zero_length_read_never_touches_the_link() {
    let sim = SimulatedBusPirate::new();
    let mut session = simulated_session(&sim).unwrap();
    let before = sim.written().len();

    let mut device = RegisterDevice::new(&mut session, 0x52);
    let err = device.read(0, 0).unwrap_err();
    assert!(err.is_protocol_violation(), "got {:?}", err);
    assert_eq!(sim.written().len(), before);
}

#[test]
fn test_led_frame_then_device_info() {
    let sim = SimulatedBusPirate::new();
    let info = [0x34, 0x12, 0x12, 0x28, 0x02, 0x00, 0x00, 0x00];
    sim.prime_page(1, &info);

    let mut session = simulated_session(&sim).unwrap();
    let mut device = RegisterDevice::new(&mut session, 0x52);

    device.set_page(Page::Led).unwrap();
    device.set_tx_command(8).unwrap();
    let frame: Vec<u8> = [0x01, 0x02, 0x03].repeat(32);
    device.write(3, &frame).unwrap();
    assert_eq!(&sim.page_contents(2)[3..99], frame.as_slice());
    assert_eq!(sim.tx_runs(), 1);

    device.set_page(Page::DeviceInfo).unwrap();
    assert_eq!(device.read(0, 8).unwrap(), info.to_vec());

    let parsed = device.device_info().unwrap();
    assert_eq!(parsed.manufacturer, 0x1234);
    assert_eq!(parsed.version, 2);
    assert!(!sim.bus_active(), "bus must be idle after every operation");
}
