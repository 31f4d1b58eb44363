//! Outermost boundary for host programs: open, identify, run, always close.

use anyhow::Context;

use crate::bridge::{self, BridgeError, BridgeSession, I2cBridgeError};
use crate::config::BridgeConfig;
use crate::device::{DeviceError, DeviceInfo, Page, RegisterDevice};
use crate::logging::hex_dump;
use crate::serial::SerialError;

/// Bytes of the device info page logged before a handler runs.
pub const DEVICE_INFO_READ_LEN: usize = 8;

/// How a failed run is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The adapter, the bus or the peripheral refused.
    Bus,
    /// The serial port itself failed (unplugged, permissions, broken pipe).
    /// An adapter that merely stops answering counts as `Bus`.
    Io,
    Unexpected,
}

pub fn classify(err: &anyhow::Error) -> FailureKind {
    // Port failures sit at the bottom of bus errors, so look for them first.
    let link_failure = err.chain().any(|cause| {
        cause.is::<std::io::Error>()
            || matches!(
                cause.downcast_ref::<SerialError>(),
                Some(e) if !matches!(e, SerialError::Timeout { .. })
            )
    });
    if link_failure {
        return FailureKind::Io;
    }

    let bus_failure = err.chain().any(|cause| {
        cause.is::<DeviceError>()
            || cause.is::<BridgeError>()
            || cause.is::<SerialError>()
            || cause.is::<I2cBridgeError>()
    });
    if bus_failure {
        FailureKind::Bus
    } else {
        FailureKind::Unexpected
    }
}

/// Open a session on the configured port and run `handler` against the
/// configured peripheral.
pub fn run_with_device<F>(config: &BridgeConfig, handler: F) -> anyhow::Result<()>
where
    F: FnOnce(&mut RegisterDevice<'_>) -> anyhow::Result<()>,
{
    run_with_session(BridgeSession::open(config), config, handler)
}

/// Like [`run_with_device`], for a session opened some other way.
///
/// Errors are logged here with their full chain at debug level, then
/// returned so the caller can pick an exit code. The session is closed on
/// every path.
pub fn run_with_session<F>(opened: bridge::Result<BridgeSession>, config: &BridgeConfig, handler: F) -> anyhow::Result<()>
where
    F: FnOnce(&mut RegisterDevice<'_>) -> anyhow::Result<()>,
{
    let result = match opened {
        Ok(mut session) => {
            let result = identify_and_run(&mut session, config, handler);
            session.close();
            result
        }
        Err(e) => Err(anyhow::Error::new(e).context(format!("Unable to open bridge on {}", config.port))),
    };

    if let Err(e) = &result {
        report(e);
    }
    result
}

fn identify_and_run<F>(session: &mut BridgeSession, config: &BridgeConfig, handler: F) -> anyhow::Result<()>
where
    F: FnOnce(&mut RegisterDevice<'_>) -> anyhow::Result<()>,
{
    let mut device = RegisterDevice::new(session, config.device_address).with_chunk_size(config.chunk_size)?;

    device
        .set_page(Page::DeviceInfo)
        .context("Selecting the device info page")?;
    let info = device
        .read(0, DEVICE_INFO_READ_LEN)
        .context("Reading device info")?;
    log::info!("Device info: {}", hex_dump(&info));
    if let Some(parsed) = DeviceInfo::parse(&info) {
        log::info!(
            "Manufacturer 0x{:04X}, ident 0x{:04X}, version {}",
            parsed.manufacturer,
            parsed.ident,
            parsed.version
        );
    }

    handler(&mut device)
}

fn report(err: &anyhow::Error) {
    match classify(err) {
        FailureKind::Bus => log::error!("Error processing configuration. {:#}", err),
        FailureKind::Io => log::error!("I/O error: {:#}", err),
        FailureKind::Unexpected => log::error!("Unexpected error: {:#}", err),
    }
    log::debug!("{:?}", err);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{simulated_session, SimulatedBusPirate};

    fn sim_config() -> BridgeConfig {
        BridgeConfig {
            port: "sim".to_string(),
            settle_ms: 0,
            ..BridgeConfig::default()
        }
    }

    #[test]
    fn handler_sees_identified_device_and_session_is_closed() {
        let sim = SimulatedBusPirate::new();
        let mut seen = None;

        run_with_session(simulated_session(&sim), &sim_config(), |device| {
            seen = Some(device.address());
            Ok(())
        })
        .unwrap();

        assert_eq!(seen, Some(0x52));
        assert_eq!(sim.mode_name(), "text");
    }

    #[test]
    fn handler_failure_is_returned_after_close() {
        let sim = SimulatedBusPirate::new();
        let err = run_with_session(simulated_session(&sim), &sim_config(), |device| {
            device.run_command(0x7E, &[], 0)?;
            Ok(())
        })
        .unwrap_err();

        assert_eq!(classify(&err), FailureKind::Bus);
        assert!(matches!(
            err.downcast_ref::<DeviceError>(),
            Some(DeviceError::CommandFailed { status: 0x40, .. })
        ));
        assert_eq!(sim.mode_name(), "text");
    }

    #[test]
    fn failed_negotiation_skips_the_handler() {
        let sim = SimulatedBusPirate::new().fail_binary_attempts(5);
        let mut called = false;

        let err = run_with_session(simulated_session(&sim), &sim_config(), |_| {
            called = true;
            Ok(())
        })
        .unwrap_err();

        assert!(!called);
        assert_eq!(classify(&err), FailureKind::Bus);
    }

    #[test]
    fn broken_link_is_reported_as_io() {
        let sim = SimulatedBusPirate::new();
        let handle = sim.clone();
        let err = run_with_session(simulated_session(&sim), &sim_config(), move |device| {
            handle.fail_writes_after(0);
            device.write(3, &[0x00])?;
            Ok(())
        })
        .unwrap_err();

        assert_eq!(classify(&err), FailureKind::Io);
        assert!(err.downcast_ref::<DeviceError>().is_some_and(DeviceError::is_link_error));
    }

    #[test]
    fn link_failure_while_opening_is_io() {
        let sim = SimulatedBusPirate::new();
        sim.fail_writes_after(0);
        let err = run_with_session(simulated_session(&sim), &sim_config(), |_| Ok(())).unwrap_err();
        assert_eq!(classify(&err), FailureKind::Io);
    }

    #[test]
    fn classification() {
        assert_eq!(classify(&anyhow::anyhow!("boom")), FailureKind::Unexpected);
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(classify(&anyhow::Error::new(io).context("opening")), FailureKind::Io);
        let bus = BridgeError::ProtocolViolation("bad".to_string());
        assert_eq!(classify(&anyhow::Error::new(bus)), FailureKind::Bus);
        let silent = BridgeError::Link(SerialError::Timeout {
            port: "sim".to_string(),
            expected: 1,
            received: 0,
        });
        assert_eq!(classify(&anyhow::Error::new(silent)), FailureKind::Bus);
    }
}
