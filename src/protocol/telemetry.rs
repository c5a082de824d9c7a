use super::fields::{layout_length, Field, PayloadReader};
use super::{validate_frame, Address, Command, FetStatus, Module, Protection, StatusRegisters};
use crate::Error;
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// The realtime reply has room for this many cell voltages.
pub const MAX_CELLS: u16 = 16;

mod realtime {
    use super::Field;

    pub const SOC: Field = Field::unsigned("soc", 2, 4, 100.0);
    pub const VOLTAGE: Field = Field::unsigned("voltage", 6, 4, 100.0);
    pub const CELL_VOLTAGE: Field = Field::unsigned("cell_voltage", 12, 4, 1000.0);
    pub const MOSFET_TEMPERATURE: Field = Field::signed("mosfet_temperature", 84, 4, 10.0);
    pub const TEMPERATURE: Field = Field::signed("temperature", 90, 4, 10.0);
    pub const CURRENT: Field = Field::signed("current", 106, 4, 100.0);
    pub const CAPACITY: Field = Field::unsigned("capacity", 120, 4, 100.0);
    pub const CAPACITY_REMAINING: Field = Field::unsigned("capacity_remaining", 124, 4, 100.0);
    pub const CYCLES: Field = Field::unsigned("cycles", 128, 4, 1.0);
    pub const VOLTAGE_STATUS: Field = Field::unsigned("voltage_status", 132, 4, 1.0);
    pub const CURRENT_STATUS: Field = Field::unsigned("current_status", 136, 4, 1.0);
    pub const TEMPERATURE_STATUS: Field = Field::unsigned("temperature_status", 140, 4, 1.0);
    pub const WARNING_STATUS: Field = Field::unsigned("warning_status", 144, 4, 1.0);
    pub const FET_STATUS: Field = Field::unsigned("fet_status", 148, 4, 1.0);

    pub const LAYOUT: &[Field] = &[
        SOC,
        VOLTAGE,
        CELL_VOLTAGE.nth(15),
        MOSFET_TEMPERATURE,
        TEMPERATURE.nth(3),
        CURRENT,
        CAPACITY,
        CAPACITY_REMAINING,
        CYCLES,
        VOLTAGE_STATUS,
        CURRENT_STATUS,
        TEMPERATURE_STATUS,
        WARNING_STATUS,
        FET_STATUS,
    ];
}

/// Reply to the realtime data command: measurements, counters and the raw
/// status registers with the alarm levels derived from them.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RealtimeData {
    pub soc_percent: f32,
    pub voltage: f32,
    pub current: f32,
    pub mosfet_temperature: f32,
    pub temperatures: [f32; 4],
    pub cell_voltages: Vec<f32>,
    pub capacity: f32,
    pub capacity_remaining: f32,
    pub cycles: u32,
    pub status: StatusRegisters,
    pub fet_status: FetStatus,
    pub protection: Protection,
}

impl RealtimeData {
    pub const COMMAND: Command = Command::RealtimeData;
    pub const PAYLOAD_LENGTH: usize = layout_length(realtime::LAYOUT);

    pub fn request(address: Address) -> Vec<u8> {
        Self::COMMAND.request(address)
    }

    /// Validates a complete reply frame and decodes `n_cells` cell voltages.
    pub fn decode(rx_buffer: &[u8], n_cells: u16) -> Result<Self, Error> {
        Self::decode_payload(validate_frame(rx_buffer)?, n_cells)
    }

    pub fn decode_payload(payload: &str, n_cells: u16) -> Result<Self, Error> {
        if n_cells == 0 || n_cells > MAX_CELLS {
            return Err(Error::CellCount(n_cells));
        }
        let reader = PayloadReader::new(payload, Self::COMMAND, Self::PAYLOAD_LENGTH)?;
        use realtime::*;

        let cell_voltages = (0..usize::from(n_cells))
            .map(|n| reader.value(&CELL_VOLTAGE.nth(n)))
            .collect::<Result<Vec<_>, _>>()?;
        let mut temperatures = [0.0; 4];
        for (n, temperature) in temperatures.iter_mut().enumerate() {
            *temperature = reader.value(&TEMPERATURE.nth(n))?;
        }
        let status = StatusRegisters {
            voltage: reader.raw(&VOLTAGE_STATUS)? as u16,
            current: reader.raw(&CURRENT_STATUS)? as u16,
            temperature: reader.raw(&TEMPERATURE_STATUS)? as u16,
            warning: reader.raw(&WARNING_STATUS)? as u16,
        };
        log::trace!("Status registers {status:04X?}");

        Ok(Self {
            soc_percent: reader.value(&SOC)?,
            voltage: reader.value(&VOLTAGE)?,
            current: reader.value(&CURRENT)?,
            mosfet_temperature: reader.value(&MOSFET_TEMPERATURE)?,
            temperatures,
            cell_voltages,
            capacity: reader.value(&CAPACITY)?,
            capacity_remaining: reader.value(&CAPACITY_REMAINING)?,
            cycles: reader.raw(&CYCLES)?,
            status,
            fet_status: FetStatus(reader.raw(&FET_STATUS)? as u16),
            protection: Protection::from_registers(&status),
        })
    }
}

mod system {
    use super::Field;

    pub const CELL_VOLTAGE_UPPER_LIMIT: Field =
        Field::unsigned("cell_voltage_upper_limit", 2, 4, 1000.0);
    pub const CELL_VOLTAGE_LOWER_LIMIT: Field =
        Field::unsigned("cell_voltage_lower_limit", 6, 4, 1000.0);
    pub const TEMPERATURE_UPPER_LIMIT: Field =
        Field::unsigned("temperature_upper_limit", 10, 4, 1.0);
    pub const TEMPERATURE_LOWER_LIMIT: Field =
        Field::unsigned("temperature_lower_limit", 14, 4, 1.0);
    pub const CHARGE_CURRENT_UPPER_LIMIT: Field =
        Field::unsigned("charge_current_upper_limit", 18, 4, 100.0);
    pub const PACK_VOLTAGE_UPPER_LIMIT: Field =
        Field::unsigned("pack_voltage_upper_limit", 22, 4, 1000.0);
    pub const PACK_VOLTAGE_LOWER_LIMIT: Field =
        Field::unsigned("pack_voltage_lower_limit", 26, 4, 1000.0);
    pub const CELL_COUNT: Field = Field::unsigned("cell_count", 30, 4, 1.0);
    pub const CHARGE_CURRENT_LIMIT: Field = Field::unsigned("charge_current_limit", 34, 4, 100.0);
    pub const DESIGN_CAPACITY: Field = Field::unsigned("design_capacity", 38, 4, 100.0);
    pub const HISTORY_INTERVAL: Field = Field::unsigned("history_interval", 42, 4, 1.0);
    pub const BALANCING_MODE: Field = Field::unsigned("balancing_mode", 46, 4, 1.0);
    pub const PRODUCT_BARCODE: Field = Field::text("product_barcode", 50, 40);
    pub const BMS_BARCODE: Field = Field::text("bms_barcode", 90, 40);

    pub const LAYOUT: &[Field] = &[
        CELL_VOLTAGE_UPPER_LIMIT,
        CELL_VOLTAGE_LOWER_LIMIT,
        TEMPERATURE_UPPER_LIMIT,
        TEMPERATURE_LOWER_LIMIT,
        CHARGE_CURRENT_UPPER_LIMIT,
        PACK_VOLTAGE_UPPER_LIMIT,
        PACK_VOLTAGE_LOWER_LIMIT,
        CELL_COUNT,
        CHARGE_CURRENT_LIMIT,
        DESIGN_CAPACITY,
        HISTORY_INTERVAL,
        BALANCING_MODE,
        PRODUCT_BARCODE,
        BMS_BARCODE,
    ];
}

/// Reply to the cell/system parameters command.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SystemParameters {
    pub cell_voltage_upper_limit: f32,
    pub cell_voltage_lower_limit: f32,
    /// Unscaled, as reported by the BMS.
    pub temperature_upper_limit: u32,
    /// Unscaled, as reported by the BMS.
    pub temperature_lower_limit: u32,
    pub charge_current_upper_limit: f32,
    pub pack_voltage_upper_limit: f32,
    pub pack_voltage_lower_limit: f32,
    pub cell_count: u16,
    pub charge_current_limit: f32,
    pub design_capacity: f32,
    pub history_interval: u32,
    pub balancing_mode: u32,
    pub product_barcode: Option<String>,
    pub bms_barcode: Option<String>,
}

/// Charge and discharge current limits after FET gating.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CurrentLimits {
    pub max_charge_current: f32,
    pub max_discharge_current: f32,
}

impl SystemParameters {
    pub const COMMAND: Command = Command::SystemParameters;
    pub const PAYLOAD_LENGTH: usize = layout_length(system::LAYOUT);

    pub fn request(address: Address) -> Vec<u8> {
        Self::COMMAND.request(address)
    }

    pub fn decode(rx_buffer: &[u8]) -> Result<Self, Error> {
        Self::decode_payload(validate_frame(rx_buffer)?)
    }

    pub fn decode_payload(payload: &str) -> Result<Self, Error> {
        let reader = PayloadReader::new(payload, Self::COMMAND, Self::PAYLOAD_LENGTH)?;
        use system::*;

        // an unreadable barcode is reported as absent
        let barcode = |field: &Field| match reader.text(field) {
            Ok(text) => Some(text),
            Err(err) => {
                log::debug!("Ignoring {}: {err}", field.name);
                None
            }
        };

        Ok(Self {
            cell_voltage_upper_limit: reader.value(&CELL_VOLTAGE_UPPER_LIMIT)?,
            cell_voltage_lower_limit: reader.value(&CELL_VOLTAGE_LOWER_LIMIT)?,
            temperature_upper_limit: reader.raw(&TEMPERATURE_UPPER_LIMIT)?,
            temperature_lower_limit: reader.raw(&TEMPERATURE_LOWER_LIMIT)?,
            charge_current_upper_limit: reader.value(&CHARGE_CURRENT_UPPER_LIMIT)?,
            pack_voltage_upper_limit: reader.value(&PACK_VOLTAGE_UPPER_LIMIT)?,
            pack_voltage_lower_limit: reader.value(&PACK_VOLTAGE_LOWER_LIMIT)?,
            cell_count: reader.raw(&CELL_COUNT)? as u16,
            charge_current_limit: reader.value(&CHARGE_CURRENT_LIMIT)?,
            design_capacity: reader.value(&DESIGN_CAPACITY)?,
            history_interval: reader.raw(&HISTORY_INTERVAL)?,
            balancing_mode: reader.raw(&BALANCING_MODE)?,
            product_barcode: barcode(&PRODUCT_BARCODE),
            bms_barcode: barcode(&BMS_BARCODE),
        })
    }

    /// A disengaged FET forces its limit to zero, otherwise both directions
    /// report the configured charge current limit.
    pub fn current_limits(&self, fet_status: FetStatus) -> CurrentLimits {
        let limit = |engaged: bool| if engaged { self.charge_current_limit } else { 0.0 };
        CurrentLimits {
            max_charge_current: limit(fet_status.charge_engaged()),
            max_discharge_current: limit(fet_status.discharge_engaged()),
        }
    }
}

mod manufacturer {
    use super::Field;

    pub const HARDWARE_TYPE: Field = Field::text("hardware_type", 0, 20);
    pub const PRODUCT_CODE: Field = Field::text("product_code", 20, 20);
    pub const PROJECT_CODE: Field = Field::text("project_code", 40, 20);
    pub const FIRMWARE_VERSION: Field = Field::text("firmware_version", 60, 6);
}

/// Reply to the manufacturer info command.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ManufacturerInfo {
    pub hardware_type: String,
    pub product_code: String,
    pub project_code: String,
    pub firmware_version: String,
}

impl ManufacturerInfo {
    pub const COMMAND: Command = Command::ManufacturerInfo;
    // The reply is longer than the fields read from it.
    pub const PAYLOAD_LENGTH: usize = 3 * 20 + 10;

    pub fn request(address: Address) -> Vec<u8> {
        Self::COMMAND.request(address)
    }

    pub fn decode(rx_buffer: &[u8]) -> Result<Self, Error> {
        Self::decode_payload(validate_frame(rx_buffer)?)
    }

    pub fn decode_payload(payload: &str) -> Result<Self, Error> {
        let reader = PayloadReader::new(payload, Self::COMMAND, Self::PAYLOAD_LENGTH)?;
        use manufacturer::*;
        Ok(Self {
            hardware_type: reader.text(&HARDWARE_TYPE)?,
            product_code: reader.text(&PRODUCT_CODE)?,
            project_code: reader.text(&PROJECT_CODE)?,
            firmware_version: reader.version(&FIRMWARE_VERSION)?,
        })
    }
}

impl fmt::Display for ManufacturerInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.product_code, self.project_code, self.hardware_type, self.firmware_version
        )
    }
}

mod capacity {
    use super::Field;

    pub const CAPACITY_REMAINING: Field = Field::unsigned("capacity_remaining", 0, 4, 100.0);
    pub const CAPACITY: Field = Field::unsigned("capacity", 4, 4, 100.0);
    pub const DESIGN_CAPACITY: Field = Field::unsigned("design_capacity", 8, 4, 100.0);
    pub const TOTAL_CHARGED_CAPACITY: Field =
        Field::unsigned("total_charged_capacity", 12, 8, 100.0);
    pub const TOTAL_AH_DRAWN: Field = Field::unsigned("total_ah_drawn", 20, 8, 1.0);
    pub const CHARGED_ENERGY: Field = Field::unsigned("charged_energy", 28, 4, 10.0);
    pub const DISCHARGED_ENERGY: Field = Field::unsigned("discharged_energy", 32, 4, 10.0);

    pub const LAYOUT: &[Field] = &[
        CAPACITY_REMAINING,
        CAPACITY,
        DESIGN_CAPACITY,
        TOTAL_CHARGED_CAPACITY,
        TOTAL_AH_DRAWN,
        CHARGED_ENERGY,
        DISCHARGED_ENERGY,
    ];
}

/// Reply to the capacity parameter block: current capacity and history.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CapacityParameters {
    pub capacity_remaining: f32,
    pub capacity: f32,
    pub design_capacity: f32,
    pub total_charged_capacity: f32,
    pub total_ah_drawn: u32,
    pub charged_energy: f32,
    pub discharged_energy: f32,
}

impl CapacityParameters {
    pub const COMMAND: Command = Command::ManufacturerParameters(Module::CapacityParameters);
    pub const PAYLOAD_LENGTH: usize = layout_length(capacity::LAYOUT);

    pub fn request(address: Address) -> Vec<u8> {
        Self::COMMAND.request(address)
    }

    pub fn decode(rx_buffer: &[u8]) -> Result<Self, Error> {
        Self::decode_payload(validate_frame(rx_buffer)?)
    }

    pub fn decode_payload(payload: &str) -> Result<Self, Error> {
        let reader = PayloadReader::new(payload, Self::COMMAND, Self::PAYLOAD_LENGTH)?;
        use capacity::*;
        Ok(Self {
            capacity_remaining: reader.value(&CAPACITY_REMAINING)?,
            capacity: reader.value(&CAPACITY)?,
            design_capacity: reader.value(&DESIGN_CAPACITY)?,
            total_charged_capacity: reader.value(&TOTAL_CHARGED_CAPACITY)?,
            total_ah_drawn: reader.raw(&TOTAL_AH_DRAWN)?,
            charged_energy: reader.value(&CHARGED_ENERGY)?,
            discharged_energy: reader.value(&DISCHARGED_ENERGY)?,
        })
    }
}

const SERIAL_NUMBER: Field = Field::text("serial_number", 0, 30);

/// Serial number from the manufacturing parameter block, unique per unit.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SerialNumber(pub String);

impl SerialNumber {
    pub const COMMAND: Command = Command::ManufacturerParameters(Module::ManufacturingParameters);
    pub const PAYLOAD_LENGTH: usize = SERIAL_NUMBER.end();

    pub fn request(address: Address) -> Vec<u8> {
        Self::COMMAND.request(address)
    }

    pub fn decode(rx_buffer: &[u8]) -> Result<Self, Error> {
        Self::decode_payload(validate_frame(rx_buffer)?)
    }

    pub fn decode_payload(payload: &str) -> Result<Self, Error> {
        let reader = PayloadReader::new(payload, Self::COMMAND, Self::PAYLOAD_LENGTH)?;
        Ok(Self(reader.text(&SERIAL_NUMBER)?))
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a unit reports about itself. Read once per connection.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceIdentity {
    pub serial_number: SerialNumber,
    pub manufacturer: ManufacturerInfo,
}

/// One complete poll of a unit.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Telemetry {
    pub soc_percent: f32,
    pub voltage: f32,
    pub current: f32,
    pub mosfet_temperature: f32,
    pub temperatures: [f32; 4],
    pub cell_count: u16,
    pub cell_voltages: Vec<f32>,
    pub charge_cycles: u32,
    pub capacity: f32,
    pub capacity_remaining: f32,
    pub total_ah_drawn: u32,
    pub charged_energy: f32,
    pub discharged_energy: f32,
    pub protection: Protection,
    pub charge_fet: bool,
    pub discharge_fet: bool,
    pub current_limits: CurrentLimits,
}

impl Telemetry {
    /// Capacity figures are taken from the capacity block, which is read
    /// after the realtime data.
    pub fn new(
        realtime: &RealtimeData,
        parameters: &SystemParameters,
        capacity: &CapacityParameters,
    ) -> Self {
        Self {
            soc_percent: realtime.soc_percent,
            voltage: realtime.voltage,
            current: realtime.current,
            mosfet_temperature: realtime.mosfet_temperature,
            temperatures: realtime.temperatures,
            cell_count: parameters.cell_count,
            cell_voltages: realtime.cell_voltages.clone(),
            charge_cycles: realtime.cycles,
            capacity: capacity.capacity,
            capacity_remaining: capacity.capacity_remaining,
            total_ah_drawn: capacity.total_ah_drawn,
            charged_energy: capacity.charged_energy,
            discharged_energy: capacity.discharged_energy,
            protection: realtime.protection,
            charge_fet: realtime.fet_status.charge_engaged(),
            discharge_fet: realtime.fet_status.discharge_engaged(),
            current_limits: parameters.current_limits(realtime.fet_status),
        }
    }
}
