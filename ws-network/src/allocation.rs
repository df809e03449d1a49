use serde::{Deserialize, Serialize};
use ws_core::{Error, Result};

/// Number of /30 blocks in `172.16.0.0/16`.
pub const POOL_SIZE: u32 = 16384;

const SUBNET_FIRST_OCTET: u8 = 172;
const SUBNET_SECOND_OCTET: u8 = 16;
const NETMASK: &str = "255.255.255.252";
const TAP_PREFIX: &str = "fctap";

/// Network identity derived from a slot number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotAllocation {
    pub slot: u32,
    pub tap_name: String,
    pub tap_ip: String,
    pub guest_ip: String,
    pub guest_mac: String,
    pub mask: String,
}

impl SlotAllocation {
    pub fn for_slot(slot: u32) -> Result<Self> {
        if slot >= POOL_SIZE {
            return Err(Error::Validation(format!(
                "slot {} is outside the pool of {} slots",
                slot, POOL_SIZE
            )));
        }

        let base = slot * 4;
        let third = (base >> 8) as u8;
        let fourth = (base & 0xff) as u8;
        let tap_last = fourth + 1;
        let guest_last = fourth + 2;

        Ok(Self {
            slot,
            tap_name: format!("{}{}", TAP_PREFIX, slot),
            tap_ip: format!(
                "{}.{}.{}.{}",
                SUBNET_FIRST_OCTET, SUBNET_SECOND_OCTET, third, tap_last
            ),
            guest_ip: format!(
                "{}.{}.{}.{}",
                SUBNET_FIRST_OCTET, SUBNET_SECOND_OCTET, third, guest_last
            ),
            guest_mac: format!(
                "06:00:{:02X}:{:02X}:{:02X}:{:02X}",
                SUBNET_FIRST_OCTET, SUBNET_SECOND_OCTET, third, guest_last
            ),
            mask: NETMASK.to_string(),
        })
    }
}
