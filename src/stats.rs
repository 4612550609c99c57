//! Link and transceiver counters, the known-master map and activity counters.

use core::fmt;

use crate::types::Address;

/// Protocol level counters kept by the link worker.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LinkStats {
    pub rx_err: u32,
    pub rx_token: u32,
    pub rx_mgmt: u32,
    pub rx_unicast: u32,
    pub rx_bcast: u32,
    pub tx_token: u32,
    pub tx_mgmt: u32,
    pub tx_pfm: u32,
    pub tx_unicast: u32,
    pub tx_bcast: u32,
    pub token_lost: u32,
    /// Frames dropped because the receive mailbox was still full.
    pub rx_dropped: u32,
    /// Management responses that did not match the outstanding request.
    pub mgmt_mismatch: u32,
}

impl fmt::Display for LinkStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "RX: err={} token={} mgmt={} unicast={} bcast={} dropped={}",
            self.rx_err,
            self.rx_token,
            self.rx_mgmt,
            self.rx_unicast,
            self.rx_bcast,
            self.rx_dropped
        )?;
        write!(
            f,
            "TX: token={} mgmt={} pfm={} unicast={} bcast={} | token lost={} mgmt mismatch={}",
            self.tx_token,
            self.tx_mgmt,
            self.tx_pfm,
            self.tx_unicast,
            self.tx_bcast,
            self.token_lost,
            self.mgmt_mismatch
        )
    }
}

/// Byte level counters kept by the transceiver.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CommStats {
    pub rx_idle: u32,
    pub rx_break: u32,
    pub rx_timeout: u32,
    pub rx_frames: u32,
    pub rx_short: u32,
    pub rx_err_sync: u32,
    pub rx_err_crc: u32,
    pub rx_err_datlen: u32,
    pub rx_err_datcrc: u32,
    pub rx_err_uart: u32,
    pub rx_overrun: u32,
    pub tx_bcast: u32,
    pub tx_unicast: u32,
    pub tx_token: u32,
    pub tx_mgmt: u32,
    pub tx_pfm: u32,
}

impl fmt::Display for CommStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "RX: idle={} break={} timeout={} frames={} short={} overrun={}",
            self.rx_idle,
            self.rx_break,
            self.rx_timeout,
            self.rx_frames,
            self.rx_short,
            self.rx_overrun
        )?;
        writeln!(
            f,
            "RX errors: sync={} crc={} datlen={} datcrc={} uart={}",
            self.rx_err_sync,
            self.rx_err_crc,
            self.rx_err_datlen,
            self.rx_err_datcrc,
            self.rx_err_uart
        )?;
        write!(
            f,
            "TX: bcast={} unicast={} token={} mgmt={} pfm={}",
            self.tx_bcast, self.tx_unicast, self.tx_token, self.tx_mgmt, self.tx_pfm
        )
    }
}

/// Bitmap of master addresses seen on the bus.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NetMap(u128);

impl NetMap {
    /// A map holding only `address`.
    pub fn with(address: Address) -> Self {
        let mut map = Self::default();
        map.insert(address);
        map
    }

    /// Addresses above 127 are not masters and are ignored.
    pub fn insert(&mut self, address: Address) {
        if *address < 128 {
            self.0 |= 1 << *address;
        }
    }

    pub fn contains(&self, address: Address) -> bool {
        *address < 128 && self.0 & (1 << *address) != 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn first(&self) -> Option<Address> {
        self.iter().next()
    }

    pub fn iter(&self) -> impl Iterator<Item = Address> + '_ {
        (0..128u8)
            .filter(move |a| self.0 & (1 << a) != 0)
            .map(Address::from_wire)
    }
}

/// Per master frame counters, read and cleared by the application.
#[derive(Debug, Clone)]
pub(crate) struct Activity([u32; 128]);

impl Default for Activity {
    fn default() -> Self {
        Activity([0; 128])
    }
}

impl Activity {
    pub fn record(&mut self, address: Address) {
        if let Some(count) = self.0.get_mut(*address as usize) {
            *count = count.saturating_add(1);
        }
    }

    pub fn clear(&mut self) {
        self.0 = [0; 128];
    }

    /// Addresses with activity since the last call, clearing the counters.
    pub fn take(&mut self) -> Vec<(Address, u32)> {
        let active = self
            .0
            .iter()
            .enumerate()
            .filter(|(_, &count)| count > 0)
            .map(|(addr, &count)| (Address::from_wire(addr as u8), count))
            .collect();
        self.clear();
        active
    }
}
