//! GATT attribute model: services, characteristics and descriptors

use btleplug::api::CharPropFlags;
use uuid::Uuid;

use crate::bluetooth::uuids::CLIENT_CHARACTERISTIC_CONFIGURATION;

/// A discovered GATT service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub primary: bool,
    pub characteristics: Vec<GattCharacteristic>,
}

/// A characteristic inside a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub service_uuid: Uuid,
    pub properties: CharPropFlags,
    pub descriptors: Vec<GattDescriptor>,
}

/// A descriptor attached to a characteristic
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GattDescriptor {
    pub uuid: Uuid,
    pub service_uuid: Uuid,
    pub characteristic_uuid: Uuid,
}

impl GattService {
    /// Find a characteristic by UUID
    pub fn characteristic(&self, uuid: &Uuid) -> Option<&GattCharacteristic> {
        self.characteristics.iter().find(|c| c.uuid == *uuid)
    }
}

impl GattCharacteristic {
    /// Characteristic with no descriptors
    pub fn new(uuid: Uuid, service_uuid: Uuid, properties: CharPropFlags) -> Self {
        Self {
            uuid,
            service_uuid,
            properties,
            descriptors: Vec::new(),
        }
    }

    /// Attach a descriptor by UUID
    pub fn with_descriptor(mut self, uuid: Uuid) -> Self {
        self.descriptors.push(GattDescriptor {
            uuid,
            service_uuid: self.service_uuid,
            characteristic_uuid: self.uuid,
        });
        self
    }

    /// The client characteristic configuration descriptor, if present
    pub fn cccd(&self) -> Option<&GattDescriptor> {
        self.descriptors
            .iter()
            .find(|d| d.uuid == CLIENT_CHARACTERISTIC_CONFIGURATION)
    }

    /// Whether the characteristic can notify
    pub fn can_notify(&self) -> bool {
        self.properties.contains(CharPropFlags::NOTIFY)
    }

    /// Whether the characteristic can only indicate
    pub fn indicate_only(&self) -> bool {
        self.properties.contains(CharPropFlags::INDICATE) && !self.can_notify()
    }
}

/// Find a characteristic anywhere in a service list
pub fn find_characteristic<'a>(
    services: &'a [GattService],
    uuid: &Uuid,
) -> Option<&'a GattCharacteristic> {
    services.iter().find_map(|s| s.characteristic(uuid))
}
