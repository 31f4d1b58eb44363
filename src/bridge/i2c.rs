//! `embedded-hal` I2C bus on top of a bridge session.
//!
//! Lets any driver written against `embedded_hal::i2c::I2c` run from the host
//! through the adapter. Addresses are 7-bit here; the register protocol in
//! [`crate::device`] keeps using the firmware's 8-bit convention.

use embedded_hal::i2c::{self, ErrorKind, ErrorType, NoAcknowledgeSource, Operation, SevenBitAddress};

use super::command::MAX_BULK_LEN;
use super::{BridgeError, BridgeSession};

#[derive(Debug, thiserror::Error)]
pub enum I2cBridgeError {
    #[error("address 0x{0:02X} not acknowledged")]
    AddressNack(u8),

    #[error("data byte not acknowledged")]
    DataNack,

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

impl i2c::Error for I2cBridgeError {
    fn kind(&self) -> ErrorKind {
        match self {
            I2cBridgeError::AddressNack(_) => ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address),
            I2cBridgeError::DataNack => ErrorKind::NoAcknowledge(NoAcknowledgeSource::Data),
            I2cBridgeError::Bridge(_) => ErrorKind::Other,
        }
    }
}

pub struct I2cBridge {
    session: BridgeSession,
}

impl I2cBridge {
    pub fn new(session: BridgeSession) -> Self {
        Self { session }
    }

    pub fn session_mut(&mut self) -> &mut BridgeSession {
        &mut self.session
    }

    pub fn into_inner(self) -> BridgeSession {
        self.session
    }

    fn run(&mut self, address: SevenBitAddress, operations: &mut [Operation<'_>]) -> Result<(), I2cBridgeError> {
        let write_address = address << 1;
        let mut previous_is_read = None;

        for index in 0..operations.len() {
            let is_read = matches!(operations[index], Operation::Read(_));
            let next_is_read = operations
                .get(index + 1)
                .map(|op| matches!(op, Operation::Read(_)));

            // Adjacent operations of the same kind share one address phase.
            if previous_is_read != Some(is_read) {
                self.session.send_start_bit()?;
                let address_byte = if is_read { write_address | 1 } else { write_address };
                if !self.session.bulk_transfer(&[address_byte])?.is_success() {
                    return Err(I2cBridgeError::AddressNack(address));
                }
            }

            match &mut operations[index] {
                Operation::Write(bytes) => {
                    for chunk in bytes.chunks(MAX_BULK_LEN) {
                        if !self.session.bulk_transfer(chunk)?.is_success() {
                            return Err(I2cBridgeError::DataNack);
                        }
                    }
                }
                Operation::Read(buffer) => {
                    let len = buffer.len();
                    for (n, slot) in buffer.iter_mut().enumerate() {
                        *slot = self.session.read_byte()?;
                        let last = n + 1 == len && next_is_read != Some(true);
                        if last {
                            self.session.send_nack()?;
                        } else {
                            self.session.send_ack()?;
                        }
                    }
                }
            }

            previous_is_read = Some(is_read);
        }

        Ok(())
    }
}

impl ErrorType for I2cBridge {
    type Error = I2cBridgeError;
}

impl i2c::I2c<SevenBitAddress> for I2cBridge {
    fn transaction(&mut self, address: SevenBitAddress, operations: &mut [Operation<'_>]) -> Result<(), Self::Error> {
        if address > 0x7F {
            return Err(BridgeError::ProtocolViolation(format!("0x{:02X} is not a 7-bit address", address)).into());
        }
        if operations.is_empty() {
            return Ok(());
        }

        match self.run(address, operations) {
            Ok(()) => {
                self.session.send_stop_bit()?;
                Ok(())
            }
            Err(e) => {
                if let Err(stop) = self.session.send_stop_bit() {
                    log::warn!("[BusPirate({})] stop bit after failed transaction: {}", self.session.port_name(), stop);
                }
                Err(e)
            }
        }
    }
}
