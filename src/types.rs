//! This module defines range-checked types for MS/TP station addresses,
//! frame types and link roles, meant to simplify correct usage of the API.

use snafu::{ensure, OptionExt, Snafu};

use core::convert::{TryFrom, TryInto};
use core::fmt;
use core::ops::Deref;

/// Error type for this module
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// The value isn't a valid MS/TP station address.
    #[snafu(display("Invalid address"))]
    InvalidAddress,
    /// The value isn't a valid link role.
    #[snafu(display("Invalid role"))]
    InvalidRole,
}

const fn invalid_address() -> InvalidAddressSnafu {
    InvalidAddressSnafu
}

/// Address is a station address on the bus. Stations use \[0, 254\],
/// 255 is reserved for [`Address::BROADCAST`].
///
/// ## Example
/// ```
/// use mstp_link::Address;
/// use std::convert::TryInto;
/// let addr = Address::new(10).unwrap();
/// let addr: Address = 10.try_into().unwrap();
/// assert!(Address::new(255).is_err());
/// ```
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Copy, Clone, Hash)]
#[repr(transparent)]
pub struct Address(u8);

/// Create a new station [`Address`], panics if it is the broadcast address.
pub const fn addr(a: u8) -> Address {
    if a < 255 {
        return Address(a);
    }
    panic!("Invalid address.")
}

impl Address {
    /// The broadcast destination address.
    pub const BROADCAST: Address = Address(255);

    /// Create a new station address, checking that it is in \[0, 254\].
    /// # Errors
    /// Returns [`Error::InvalidAddress`] if `address` is out of range.
    pub fn new(address: impl TryInto<u8>) -> Result<Self, Error> {
        let address = address.try_into().ok().with_context(invalid_address)?;
        ensure!(address < 255, invalid_address());
        Ok(Self(address))
    }

    /// Any byte seen on the wire, including the broadcast address.
    pub(crate) const fn from_wire(byte: u8) -> Self {
        Self(byte)
    }

    /// True for the broadcast address.
    pub const fn is_broadcast(self) -> bool {
        self.0 == 255
    }
}

impl Deref for Address {
    type Target = u8;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl PartialEq<u8> for Address {
    fn eq(&self, other: &u8) -> bool {
        self.0 == *other
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_broadcast() {
            f.write_str("*")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Trait to convert `T: TryInto<u8>` into an [`Address`].
pub trait IntoAddress {
    /// Convert self to an Address.
    /// # Errors
    /// Returns `Error:InvalidAddress` if self isn't a valid station address.
    fn into_address(self) -> Result<Address, Error>;
}

impl IntoAddress for Address {
    fn into_address(self) -> Result<Address, Error> {
        Ok(self)
    }
}

impl<T> IntoAddress for T
where
    T: TryInto<u8>,
{
    fn into_address(self) -> Result<Address, Error> {
        Address::new(self)
    }
}

impl TryFrom<usize> for Address {
    type Error = Error;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}


/// MS/TP frame type, the third byte of every frame header.
#[derive(PartialEq, Eq, Debug, Copy, Clone, Hash)]
pub enum FrameType {
    Token,
    PollForMaster,
    ReplyToPollForMaster,
    TestRequest,
    TestResponse,
    BacnetDataExpectingReply,
    BacnetDataNotExpectingReply,
    ReplyPostponed,
    /// Proprietary data frame expecting a reply, \[0x80, 0xBF\].
    DataExpectingReply(u8),
    /// Proprietary data frame not expecting a reply, \[0xC0, 0xFF\].
    DataNotExpectingReply(u8),
    /// Reserved frame types \[8, 0x7F\].
    Unknown(u8),
}

impl FrameType {
    /// Frames that put the receiver into the answer-data state when unicast.
    pub const fn expects_reply(self) -> bool {
        matches!(
            self,
            FrameType::BacnetDataExpectingReply | FrameType::DataExpectingReply(_)
        )
    }

    /// Frames that may be sent as the answer to a data request.
    pub const fn is_reply(self) -> bool {
        matches!(
            self,
            FrameType::TestResponse
                | FrameType::BacnetDataNotExpectingReply
                | FrameType::DataNotExpectingReply(_)
        )
    }

    /// Frames handed to the application receive mailbox.
    pub const fn is_data(self) -> bool {
        self.expects_reply() || self.is_reply()
    }

    /// Frames the application is allowed to queue with `Link::send`.
    pub const fn is_sendable(self) -> bool {
        self.is_data() || matches!(self, FrameType::TestRequest)
    }

    /// Token passing and polling frames.
    pub const fn is_management(self) -> bool {
        matches!(
            self,
            FrameType::PollForMaster
                | FrameType::ReplyToPollForMaster
                | FrameType::TestRequest
                | FrameType::TestResponse
                | FrameType::ReplyPostponed
        )
    }
}

impl From<u8> for FrameType {
    fn from(byte: u8) -> Self {
        match byte {
            0 => FrameType::Token,
            1 => FrameType::PollForMaster,
            2 => FrameType::ReplyToPollForMaster,
            3 => FrameType::TestRequest,
            4 => FrameType::TestResponse,
            5 => FrameType::BacnetDataExpectingReply,
            6 => FrameType::BacnetDataNotExpectingReply,
            7 => FrameType::ReplyPostponed,
            0x80..=0xbf => FrameType::DataExpectingReply(byte),
            0xc0..=0xff => FrameType::DataNotExpectingReply(byte),
            _ => FrameType::Unknown(byte),
        }
    }
}

impl From<FrameType> for u8 {
    fn from(frame_type: FrameType) -> Self {
        match frame_type {
            FrameType::Token => 0,
            FrameType::PollForMaster => 1,
            FrameType::ReplyToPollForMaster => 2,
            FrameType::TestRequest => 3,
            FrameType::TestResponse => 4,
            FrameType::BacnetDataExpectingReply => 5,
            FrameType::BacnetDataNotExpectingReply => 6,
            FrameType::ReplyPostponed => 7,
            FrameType::DataExpectingReply(x)
            | FrameType::DataNotExpectingReply(x)
            | FrameType::Unknown(x) => x,
        }
    }
}

/// The role a link runs on the bus.
#[derive(PartialEq, Eq, Debug, Copy, Clone, Hash)]
#[repr(u8)]
pub enum Role {
    /// Not attached, the worker idles.
    None = 0,
    /// Token passing master.
    Master = 1,
    /// Responder that never holds the token.
    Slave = 2,
    /// Passive listener, never transmits.
    Sniffer = 3,
}

impl TryFrom<u8> for Role {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Role::None),
            1 => Ok(Role::Master),
            2 => Ok(Role::Slave),
            3 => Ok(Role::Sniffer),
            _ => InvalidRoleSnafu.fail(),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::None => "none",
            Role::Master => "master",
            Role::Slave => "slave",
            Role::Sniffer => "sniffer",
        })
    }
}

#[cfg(test)]
mod frame_type_tests {
    use super::{FrameType, Role};
    use core::convert::TryFrom;

    #[test]
    fn test_frame_type_byte_mapping() {
        for byte in 0..=255u8 {
            assert_eq!(u8::from(FrameType::from(byte)), byte);
        }
        assert_eq!(FrameType::from(0x85), FrameType::DataExpectingReply(0x85));
        assert_eq!(FrameType::from(0xca), FrameType::DataNotExpectingReply(0xca));
        assert_eq!(FrameType::from(0x20), FrameType::Unknown(0x20));
    }

    #[test]
    fn test_classification() {
        assert!(FrameType::BacnetDataExpectingReply.expects_reply());
        assert!(FrameType::from(0xbf).expects_reply());
        assert!(!FrameType::from(0xc0).expects_reply());
        assert!(FrameType::from(0xc0).is_reply());
        assert!(FrameType::TestResponse.is_reply());
        assert!(FrameType::TestRequest.is_sendable());
        assert!(!FrameType::Token.is_sendable());
        assert!(!FrameType::ReplyPostponed.is_sendable());
        assert!(!FrameType::Unknown(9).is_sendable());
        assert!(FrameType::PollForMaster.is_management());
        assert!(!FrameType::Token.is_management());
    }

    #[test]
    fn test_role() {
        assert_eq!(Role::try_from(1).unwrap(), Role::Master);
        assert!(Role::try_from(4).is_err());
        assert_eq!(Role::Sniffer.to_string(), "sniffer");
    }
}
