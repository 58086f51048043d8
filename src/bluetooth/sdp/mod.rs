//! Serialized SDP lookups
//!
//! The stack runs one SDP query at a time, so a single token decides which
//! device is being queried. A query is two lookups on the same token:
//!
//! ```text
//! HID service (0x1124)          PnP information (0x1200)
//! descriptor list (0x0206) ──►  vendor id (0x0201), product id (0x0202) ──► commit
//! ```
//!
//! Results are staged here and handed out only after both lookups succeed.
//!
//! A query abandoned halfway (oversized or malformed attribute, removed device)
//! is still running inside the stack. The token stays blocked until the stack
//! reports that query complete; only then may the next device start.

pub mod data_element;

use super::address::BdAddr;
use super::error::BridgeError;
use super::registry::DeviceId;
use super::stack::{BluetoothStack, StatusCode};
use std::collections::VecDeque;
use tracing::{debug, error, info, warn};

pub const SERVICE_CLASS_HID: u16 = 0x1124;
pub const SERVICE_CLASS_PNP_INFORMATION: u16 = 0x1200;

pub const ATTRIBUTE_HID_DESCRIPTOR_LIST: u16 = 0x0206;
pub const ATTRIBUTE_VENDOR_ID: u16 = 0x0201;
pub const ATTRIBUTE_PRODUCT_ID: u16 = 0x0202;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryPhase {
    Descriptor,
    VendorProduct,
}

impl QueryPhase {
    fn service_class(self) -> u16 {
        match self {
            QueryPhase::Descriptor => SERVICE_CLASS_HID,
            QueryPhase::VendorProduct => SERVICE_CLASS_PNP_INFORMATION,
        }
    }
}

/// Everything both lookups found for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpResult {
    pub device: DeviceId,
    pub address: BdAddr,
    pub hid_descriptor: Vec<u8>,
    pub vendor_id: u16,
    pub product_id: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryStep {
    /// Descriptor lookup done, vendor/product lookup started.
    Chained,
    Completed(SdpResult),
    /// An abandoned query finished; the stack can take the next one.
    Drained,
}

#[derive(Debug)]
struct ActiveQuery {
    device: DeviceId,
    address: BdAddr,
    phase: QueryPhase,
    attribute: Vec<u8>,
    hid_descriptor: Option<Vec<u8>>,
    vendor_id: Option<u16>,
    product_id: Option<u16>,
}

#[derive(Debug)]
pub struct SdpQuerySerializer {
    max_attribute_size: usize,
    active: Option<ActiveQuery>,
    // Address of an abandoned query the stack has not finished yet
    abandoned: Option<BdAddr>,
    waiting: VecDeque<DeviceId>,
}

impl SdpQuerySerializer {
    pub fn new(max_attribute_size: usize) -> Self {
        Self {
            max_attribute_size,
            active: None,
            abandoned: None,
            waiting: VecDeque::new(),
        }
    }

    /// Device currently holding the query token.
    pub fn holder(&self) -> Option<DeviceId> {
        self.active.as_ref().map(|q| q.device)
    }

    /// True while a query, live or abandoned, is outstanding in the stack.
    pub fn is_busy(&self) -> bool {
        self.active.is_some() || self.abandoned.is_some()
    }

    pub fn try_acquire(&mut self, device: DeviceId, address: BdAddr) -> Result<(), BridgeError> {
        let busy_with = self.active.as_ref().map(|q| q.address).or(self.abandoned);
        if let Some(holder) = busy_with {
            return Err(BridgeError::QueryBusy { holder });
        }
        self.active = Some(ActiveQuery {
            device,
            address,
            phase: QueryPhase::Descriptor,
            attribute: Vec::new(),
            hid_descriptor: None,
            vendor_id: None,
            product_id: None,
        });
        Ok(())
    }

    /// Drops the token and any staged results.
    pub fn release(&mut self) -> Option<DeviceId> {
        let released = self.active.take().map(|q| q.device);
        if let Some(device) = released {
            debug!("SDP token released by {:?}", device);
        }
        released
    }

    /// Drops the token and the staged results of a query the stack is still
    /// running. New queries stay blocked until its completion arrives.
    pub fn abandon(&mut self) -> Option<DeviceId> {
        let query = self.active.take()?;
        warn!("Abandoning SDP query for {}, waiting for the stack to finish it", query.address);
        self.abandoned = Some(query.address);
        Some(query.device)
    }

    pub fn begin_descriptor_query<S: BluetoothStack + ?Sized>(
        &mut self,
        stack: &mut S,
        device: DeviceId,
        address: BdAddr,
    ) -> Result<(), BridgeError> {
        if let Err(e) = self.try_acquire(device, address) {
            warn!("Cannot query HID descriptor of {}: {}", address, e);
            return Err(e);
        }
        info!("Starting SDP query for HID descriptor of {}", address);
        self.issue(stack, QueryPhase::Descriptor)
    }

    pub fn begin_vendor_product_query<S: BluetoothStack + ?Sized>(
        &mut self,
        stack: &mut S,
    ) -> Result<(), BridgeError> {
        info!("Starting SDP query for vendor/product id");
        self.issue(stack, QueryPhase::VendorProduct)
    }

    fn issue<S: BluetoothStack + ?Sized>(
        &mut self,
        stack: &mut S,
        phase: QueryPhase,
    ) -> Result<(), BridgeError> {
        let query = self.active.as_mut().ok_or(BridgeError::NoQueryTarget)?;
        query.phase = phase;
        query.attribute.clear();
        let address = query.address;

        if let Err(status) = stack.query_service(address, phase.service_class()) {
            error!("Failed to start SDP query {:?} for {}: {}", phase, address, status);
            self.release();
            return Err(status.into());
        }
        Ok(())
    }

    /// Stores one attribute byte. When the attribute is complete it is decoded
    /// into the staged results.
    ///
    /// Oversized or malformed attributes abandon the query and release the token.
    pub fn on_attribute_byte(
        &mut self,
        attribute_id: u16,
        offset: u16,
        attribute_length: u16,
        byte: u8,
    ) -> Result<(), BridgeError> {
        let limit = self.max_attribute_size;
        let query = self.active.as_mut().ok_or(BridgeError::NoQueryTarget)?;

        let length = usize::from(attribute_length);
        let offset = usize::from(offset);
        if length > limit || offset >= length {
            error!(
                "SDP attribute 0x{:04x} exceeds buffer: available {}, required {} (offset {})",
                attribute_id, limit, length, offset
            );
            self.abandon();
            return Err(BridgeError::AttributeOverflow {
                attribute_id,
                length: length.max(offset + 1),
                limit,
            });
        }

        if offset == 0 || query.attribute.len() != length {
            query.attribute.clear();
            query.attribute.resize(length, 0);
        }
        query.attribute[offset] = byte;

        if offset + 1 == length {
            if let Err(e) = Self::decode_attribute(query, attribute_id) {
                error!("Abandoning SDP query: {}", e);
                self.abandon();
                return Err(e);
            }
        }
        Ok(())
    }

    fn decode_attribute(query: &mut ActiveQuery, attribute_id: u16) -> Result<(), BridgeError> {
        let malformed = |source| BridgeError::MalformedAttribute {
            attribute_id,
            source,
        };

        match (query.phase, attribute_id) {
            (QueryPhase::Descriptor, ATTRIBUTE_HID_DESCRIPTOR_LIST) => {
                let descriptors =
                    data_element::parse_hid_descriptor_list(&query.attribute).map_err(malformed)?;
                for descriptor in descriptors {
                    info!("SDP HID descriptor ({} bytes) for {}", descriptor.len(), query.address);
                    query.hid_descriptor = Some(descriptor);
                }
            }
            (QueryPhase::VendorProduct, ATTRIBUTE_VENDOR_ID) => {
                query.vendor_id = Some(data_element::parse_u16(&query.attribute).map_err(malformed)?);
            }
            (QueryPhase::VendorProduct, ATTRIBUTE_PRODUCT_ID) => {
                query.product_id = Some(data_element::parse_u16(&query.attribute).map_err(malformed)?);
            }
            (phase, id) => debug!("Ignoring SDP attribute 0x{:04x} during {:?}", id, phase),
        }
        Ok(())
    }

    /// Completion of the running lookup. The descriptor lookup chains into the
    /// vendor/product lookup; the second one releases the token and returns the
    /// results to commit. Completion of an abandoned query only unblocks the
    /// token.
    pub fn on_query_complete<S: BluetoothStack + ?Sized>(
        &mut self,
        stack: &mut S,
        status: u8,
    ) -> Result<QueryStep, BridgeError> {
        let Some(query) = self.active.as_mut() else {
            return match self.abandoned.take() {
                Some(address) => {
                    debug!("Abandoned SDP query for {} finished with status 0x{:02x}", address, status);
                    Ok(QueryStep::Drained)
                }
                None => Err(BridgeError::NoQueryTarget),
            };
        };

        if let Err(status) = StatusCode::check(status) {
            warn!("SDP query {:?} for {} failed: {}", query.phase, query.address, status);
            self.release();
            return Err(status.into());
        }

        match query.phase {
            QueryPhase::Descriptor => {
                if query.hid_descriptor.is_none() {
                    warn!("No HID descriptor in SDP record of {}", query.address);
                    self.release();
                    return Err(BridgeError::MissingAttribute(ATTRIBUTE_HID_DESCRIPTOR_LIST));
                }
                self.begin_vendor_product_query(stack)?;
                Ok(QueryStep::Chained)
            }
            QueryPhase::VendorProduct => {
                let result = SdpResult {
                    device: query.device,
                    address: query.address,
                    hid_descriptor: query.hid_descriptor.take().unwrap_or_default(),
                    vendor_id: query.vendor_id.unwrap_or(0),
                    product_id: query.product_id.unwrap_or(0),
                };
                info!(
                    "Vendor ID: 0x{:04x} - Product ID: 0x{:04x} for {}",
                    result.vendor_id, result.product_id, result.address
                );
                self.release();
                Ok(QueryStep::Completed(result))
            }
        }
    }

    /// Queues a device for a descriptor query once the token frees up.
    pub fn enqueue(&mut self, device: DeviceId) {
        if !self.waiting.contains(&device) && self.holder() != Some(device) {
            self.waiting.push_back(device);
        }
    }

    pub fn next_waiting(&mut self) -> Option<DeviceId> {
        self.waiting.pop_front()
    }

    /// Puts a device the stack refused back at the head of the queue.
    pub fn requeue(&mut self, device: DeviceId) {
        if !self.waiting.contains(&device) && self.holder() != Some(device) {
            self.waiting.push_front(device);
        }
    }

    pub fn has_waiting(&self) -> bool {
        !self.waiting.is_empty()
    }

    pub fn is_waiting(&self, device: DeviceId) -> bool {
        self.waiting.contains(&device)
    }

    /// Forgets everything about a removed device. A query it still holds is
    /// abandoned, not released: the stack keeps running it.
    pub fn forget(&mut self, device: DeviceId) {
        self.waiting.retain(|d| *d != device);
        if self.holder() == Some(device) {
            warn!("Device holding the SDP token was removed");
            self.abandon();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::registry::DeviceRegistry;
    use crate::bridge::replay::{ReplayStack, StackCommand};

    const DESCRIPTOR_LIST: [u8; 10] = [0x35, 0x08, 0x35, 0x06, 0x08, 0x22, 0x25, 0x02, 0x05, 0x01];

    fn addr(last: u8) -> BdAddr {
        BdAddr::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, last])
    }

    fn feed(sdp: &mut SdpQuerySerializer, attribute_id: u16, value: &[u8]) -> Result<(), BridgeError> {
        for (i, b) in value.iter().enumerate() {
            sdp.on_attribute_byte(attribute_id, i as u16, value.len() as u16, *b)?;
        }
        Ok(())
    }

    fn two_devices() -> (DeviceId, DeviceId) {
        let mut registry = DeviceRegistry::new(2);
        (registry.create(addr(1)).unwrap(), registry.create(addr(2)).unwrap())
    }

    #[test]
    fn second_query_is_busy_and_first_is_unaffected() {
        let (a, b) = two_devices();
        let mut stack = ReplayStack::default();
        let mut sdp = SdpQuerySerializer::new(512);

        sdp.begin_descriptor_query(&mut stack, a, addr(1)).unwrap();
        assert_eq!(
            sdp.begin_descriptor_query(&mut stack, b, addr(2)),
            Err(BridgeError::QueryBusy { holder: addr(1) })
        );
        assert_eq!(sdp.holder(), Some(a));
        assert!(sdp.is_busy());
        assert_eq!(
            stack.take_commands(),
            vec![StackCommand::QueryService {
                address: addr(1),
                service_class: SERVICE_CLASS_HID
            }]
        );
    }

    #[test]
    fn full_query_chains_and_commits_once() {
        let (a, _) = two_devices();
        let mut stack = ReplayStack::default();
        let mut sdp = SdpQuerySerializer::new(512);

        sdp.begin_descriptor_query(&mut stack, a, addr(1)).unwrap();
        feed(&mut sdp, ATTRIBUTE_HID_DESCRIPTOR_LIST, &DESCRIPTOR_LIST).unwrap();
        assert_eq!(sdp.on_query_complete(&mut stack, 0), Ok(QueryStep::Chained));
        assert_eq!(sdp.holder(), Some(a));

        feed(&mut sdp, ATTRIBUTE_VENDOR_ID, &[0x09, 0x05, 0x4C]).unwrap();
        feed(&mut sdp, ATTRIBUTE_PRODUCT_ID, &[0x09, 0x05, 0xC4]).unwrap();
        let step = sdp.on_query_complete(&mut stack, 0).unwrap();

        assert_eq!(
            step,
            QueryStep::Completed(SdpResult {
                device: a,
                address: addr(1),
                hid_descriptor: vec![0x05, 0x01],
                vendor_id: 0x054C,
                product_id: 0x05C4,
            })
        );
        assert_eq!(sdp.holder(), None);
        assert_eq!(
            stack.take_commands()[1],
            StackCommand::QueryService {
                address: addr(1),
                service_class: SERVICE_CLASS_PNP_INFORMATION
            }
        );
    }

    #[test]
    fn oversized_attribute_abandons_query() {
        let (a, _) = two_devices();
        let mut stack = ReplayStack::default();
        let mut sdp = SdpQuerySerializer::new(16);

        sdp.begin_descriptor_query(&mut stack, a, addr(1)).unwrap();
        assert_eq!(
            sdp.on_attribute_byte(ATTRIBUTE_HID_DESCRIPTOR_LIST, 0, 17, 0x35),
            Err(BridgeError::AttributeOverflow {
                attribute_id: ATTRIBUTE_HID_DESCRIPTOR_LIST,
                length: 17,
                limit: 16
            })
        );
        assert_eq!(sdp.holder(), None);
        assert_eq!(
            sdp.on_attribute_byte(ATTRIBUTE_HID_DESCRIPTOR_LIST, 1, 17, 0x08),
            Err(BridgeError::NoQueryTarget)
        );
    }

    #[test]
    fn abandoned_query_blocks_until_the_stack_finishes_it() {
        let (a, b) = two_devices();
        let mut stack = ReplayStack::default();
        let mut sdp = SdpQuerySerializer::new(16);

        sdp.begin_descriptor_query(&mut stack, a, addr(1)).unwrap();
        sdp.enqueue(b);
        assert!(sdp.on_attribute_byte(ATTRIBUTE_HID_DESCRIPTOR_LIST, 0, 40, 0x35).is_err());

        assert_eq!(sdp.holder(), None);
        assert!(sdp.is_busy());
        assert_eq!(
            sdp.begin_descriptor_query(&mut stack, b, addr(2)),
            Err(BridgeError::QueryBusy { holder: addr(1) })
        );
        assert!(sdp.is_waiting(b));

        // The stack reports the abandoned query done
        assert_eq!(sdp.on_query_complete(&mut stack, 0), Ok(QueryStep::Drained));
        assert!(!sdp.is_busy());
        assert_eq!(sdp.on_query_complete(&mut stack, 0), Err(BridgeError::NoQueryTarget));

        assert_eq!(sdp.next_waiting(), Some(b));
        sdp.begin_descriptor_query(&mut stack, b, addr(2)).unwrap();
        assert_eq!(
            stack.take_commands(),
            vec![
                StackCommand::QueryService {
                    address: addr(1),
                    service_class: SERVICE_CLASS_HID
                },
                StackCommand::QueryService {
                    address: addr(2),
                    service_class: SERVICE_CLASS_HID
                },
            ]
        );
    }

    #[test]
    fn malformed_attribute_and_removal_also_abandon() {
        let (a, _) = two_devices();
        let mut stack = ReplayStack::default();
        let mut sdp = SdpQuerySerializer::new(512);

        sdp.begin_descriptor_query(&mut stack, a, addr(1)).unwrap();
        // Not a data element sequence
        assert!(matches!(
            feed(&mut sdp, ATTRIBUTE_HID_DESCRIPTOR_LIST, &[0x09, 0x00, 0x01]),
            Err(BridgeError::MalformedAttribute { .. })
        ));
        assert!(sdp.is_busy());
        assert_eq!(sdp.on_query_complete(&mut stack, 0), Ok(QueryStep::Drained));

        sdp.begin_descriptor_query(&mut stack, a, addr(1)).unwrap();
        sdp.forget(a);
        assert_eq!(sdp.holder(), None);
        assert!(sdp.is_busy());
        assert_eq!(sdp.on_query_complete(&mut stack, 0x04), Ok(QueryStep::Drained));
        assert!(!sdp.is_busy());
    }

    #[test]
    fn failures_release_the_token_without_results() {
        let (a, _) = two_devices();
        let mut stack = ReplayStack::default();
        let mut sdp = SdpQuerySerializer::new(512);

        sdp.begin_descriptor_query(&mut stack, a, addr(1)).unwrap();
        assert_eq!(
            sdp.on_query_complete(&mut stack, 0),
            Err(BridgeError::MissingAttribute(ATTRIBUTE_HID_DESCRIPTOR_LIST))
        );
        assert_eq!(sdp.holder(), None);

        sdp.begin_descriptor_query(&mut stack, a, addr(1)).unwrap();
        feed(&mut sdp, ATTRIBUTE_HID_DESCRIPTOR_LIST, &DESCRIPTOR_LIST).unwrap();
        sdp.on_query_complete(&mut stack, 0).unwrap();
        assert_eq!(
            sdp.on_query_complete(&mut stack, 0x04),
            Err(BridgeError::Stack(StatusCode(0x04)))
        );
        assert_eq!(sdp.holder(), None);
    }

    #[test]
    fn refused_query_releases_token() {
        let (a, _) = two_devices();
        let mut stack = ReplayStack::default();
        stack.refuse_queries(true);
        let mut sdp = SdpQuerySerializer::new(512);

        assert!(matches!(
            sdp.begin_descriptor_query(&mut stack, a, addr(1)),
            Err(BridgeError::Stack(_))
        ));
        assert_eq!(sdp.holder(), None);
    }

    #[test]
    fn wait_queue_is_fifo_without_duplicates() {
        let (a, b) = two_devices();
        let mut sdp = SdpQuerySerializer::new(512);

        sdp.enqueue(b);
        sdp.enqueue(a);
        sdp.enqueue(b);
        sdp.forget(a);
        sdp.enqueue(a);

        assert_eq!(sdp.next_waiting(), Some(b));
        sdp.requeue(b);
        sdp.requeue(b);
        assert_eq!(sdp.next_waiting(), Some(b));
        assert_eq!(sdp.next_waiting(), Some(a));
        assert_eq!(sdp.next_waiting(), None);
        assert!(!sdp.has_waiting());
    }
}
