//! Mapping of the realtime status registers onto alarm levels.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

macro_rules! bits {
    ($($position:expr),* $(,)?) => {
        0u16 $(| (1u16 << $position))*
    };
}

/// Severity of one monitored condition.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum AlarmLevel {
    #[default]
    Normal = 0,
    Warning = 1,
    Protection = 2,
}

impl AlarmLevel {
    /// Protection beats warning beats normal.
    fn evaluate(register: u16, protection: u16, warning: u16) -> Self {
        if register & protection != 0 {
            AlarmLevel::Protection
        } else if register & warning != 0 {
            AlarmLevel::Warning
        } else {
            AlarmLevel::Normal
        }
    }
}

/// The four raw status words of a realtime reply.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StatusRegisters {
    pub voltage: u16,
    pub current: u16,
    pub temperature: u16,
    pub warning: u16,
}

#[derive(Debug, Clone, Copy)]
enum Register {
    Voltage,
    Current,
    Temperature,
    Warning,
}

impl StatusRegisters {
    fn get(&self, register: Register) -> u16 {
        match register {
            Register::Voltage => self.voltage,
            Register::Current => self.current,
            Register::Temperature => self.temperature,
            Register::Warning => self.warning,
        }
    }
}

/// State of the charge and discharge MOSFETs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FetStatus(pub u16);

impl FetStatus {
    pub fn charge_engaged(&self) -> bool {
        self.0 & bits!(0) != 0
    }

    pub fn discharge_engaged(&self) -> bool {
        self.0 & bits!(1) != 0
    }
}

/// Conditions reported by the BMS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum AlarmCategory {
    HighVoltage,
    LowVoltage,
    LowCellVoltage,
    LowSoc,
    HighChargeCurrent,
    HighDischargeCurrent,
    CellImbalance,
    InternalFailure,
    HighChargeTemperature,
    LowChargeTemperature,
    HighTemperature,
    LowTemperature,
    HighInternalTemperature,
    FuseBlown,
}

struct AlarmRule {
    category: AlarmCategory,
    register: Register,
    protection: u16,
    warning: u16,
}

const fn rule(
    category: AlarmCategory,
    register: Register,
    protection: u16,
    warning: u16,
) -> AlarmRule {
    AlarmRule {
        category,
        register,
        protection,
        warning,
    }
}

// Cell over voltage has no category of its own and is folded into high voltage.
// Internal failure covers warning bits 1..=6. Bit 0 (voltage difference) and
// bit 7 (low battery) are reported as cell imbalance and low SOC instead.
const ALARM_RULES: [AlarmRule; 14] = [
    rule(AlarmCategory::HighVoltage, Register::Voltage, bits!(0, 2), bits!(4, 6)),
    rule(AlarmCategory::LowVoltage, Register::Voltage, bits!(3), bits!(7)),
    rule(AlarmCategory::LowCellVoltage, Register::Voltage, bits!(1), bits!(5)),
    rule(AlarmCategory::LowSoc, Register::Warning, bits!(7), bits!()),
    rule(AlarmCategory::HighChargeCurrent, Register::Current, bits!(2), bits!(6)),
    rule(AlarmCategory::HighDischargeCurrent, Register::Current, bits!(3, 4, 5), bits!(7)),
    rule(AlarmCategory::CellImbalance, Register::Voltage, bits!(14), bits!(8)),
    rule(AlarmCategory::InternalFailure, Register::Warning, bits!(1, 2, 3, 4, 5, 6), bits!()),
    rule(AlarmCategory::HighChargeTemperature, Register::Temperature, bits!(0), bits!(8)),
    rule(AlarmCategory::LowChargeTemperature, Register::Temperature, bits!(1), bits!(9)),
    rule(AlarmCategory::HighTemperature, Register::Temperature, bits!(0, 2), bits!(8, 10)),
    rule(AlarmCategory::LowTemperature, Register::Temperature, bits!(1, 3), bits!(9, 11)),
    rule(AlarmCategory::HighInternalTemperature, Register::Temperature, bits!(4, 6), bits!(12, 14)),
    rule(AlarmCategory::FuseBlown, Register::Voltage, bits!(13), bits!()),
];

/// Alarm level of every category.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Protection {
    pub high_voltage: AlarmLevel,
    pub low_voltage: AlarmLevel,
    pub low_cell_voltage: AlarmLevel,
    pub low_soc: AlarmLevel,
    pub high_charge_current: AlarmLevel,
    pub high_discharge_current: AlarmLevel,
    pub cell_imbalance: AlarmLevel,
    pub internal_failure: AlarmLevel,
    pub high_charge_temperature: AlarmLevel,
    pub low_charge_temperature: AlarmLevel,
    pub high_temperature: AlarmLevel,
    pub low_temperature: AlarmLevel,
    pub high_internal_temperature: AlarmLevel,
    pub fuse_blown: AlarmLevel,
}

impl Protection {
    pub fn from_registers(registers: &StatusRegisters) -> Self {
        let mut protection = Self::default();
        for rule in &ALARM_RULES {
            *protection.level_mut(rule.category) = AlarmLevel::evaluate(
                registers.get(rule.register),
                rule.protection,
                rule.warning,
            );
        }
        protection
    }

    pub fn level(&self, category: AlarmCategory) -> AlarmLevel {
        match category {
            AlarmCategory::HighVoltage => self.high_voltage,
            AlarmCategory::LowVoltage => self.low_voltage,
            AlarmCategory::LowCellVoltage => self.low_cell_voltage,
            AlarmCategory::LowSoc => self.low_soc,
            AlarmCategory::HighChargeCurrent => self.high_charge_current,
            AlarmCategory::HighDischargeCurrent => self.high_discharge_current,
            AlarmCategory::CellImbalance => self.cell_imbalance,
            AlarmCategory::InternalFailure => self.internal_failure,
            AlarmCategory::HighChargeTemperature => self.high_charge_temperature,
            AlarmCategory::LowChargeTemperature => self.low_charge_temperature,
            AlarmCategory::HighTemperature => self.high_temperature,
            AlarmCategory::LowTemperature => self.low_temperature,
            AlarmCategory::HighInternalTemperature => self.high_internal_temperature,
            AlarmCategory::FuseBlown => self.fuse_blown,
        }
    }

    fn level_mut(&mut self, category: AlarmCategory) -> &mut AlarmLevel {
        match category {
            AlarmCategory::HighVoltage => &mut self.high_voltage,
            AlarmCategory::LowVoltage => &mut self.low_voltage,
            AlarmCategory::LowCellVoltage => &mut self.low_cell_voltage,
            AlarmCategory::LowSoc => &mut self.low_soc,
            AlarmCategory::HighChargeCurrent => &mut self.high_charge_current,
            AlarmCategory::HighDischargeCurrent => &mut self.high_discharge_current,
            AlarmCategory::CellImbalance => &mut self.cell_imbalance,
            AlarmCategory::InternalFailure => &mut self.internal_failure,
            AlarmCategory::HighChargeTemperature => &mut self.high_charge_temperature,
            AlarmCategory::LowChargeTemperature => &mut self.low_charge_temperature,
            AlarmCategory::HighTemperature => &mut self.high_temperature,
            AlarmCategory::LowTemperature => &mut self.low_temperature,
            AlarmCategory::HighInternalTemperature => &mut self.high_internal_temperature,
            AlarmCategory::FuseBlown => &mut self.fuse_blown,
        }
    }

    /// The most severe level over all categories.
    pub fn worst(&self) -> AlarmLevel {
        ALARM_RULES
            .iter()
            .map(|rule| self.level(rule.category))
            .max()
            .unwrap_or_default()
    }
}

impl From<&StatusRegisters> for Protection {
    fn from(registers: &StatusRegisters) -> Self {
        Self::from_registers(registers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voltage(voltage: u16) -> Protection {
        Protection::from_registers(&StatusRegisters {
            voltage,
            ..Default::default()
        })
    }

    fn temperature(temperature: u16) -> Protection {
        Protection::from_registers(&StatusRegisters {
            temperature,
            ..Default::default()
        })
    }

    #[test]
    fn zero_registers_are_normal() {
        let protection = Protection::from_registers(&StatusRegisters::default());
        assert_eq!(protection, Protection::default());
        assert_eq!(protection.worst(), AlarmLevel::Normal);
    }

    #[test]
    fn protection_beats_warning() {
        assert_eq!(voltage(bits!(0)).high_voltage, AlarmLevel::Protection);
        assert_eq!(voltage(0xFFFF).high_voltage, AlarmLevel::Protection);
        assert_eq!(voltage(bits!(0, 4, 6)).high_voltage, AlarmLevel::Protection);
        assert_eq!(voltage(bits!(6)).high_voltage, AlarmLevel::Warning);
        assert_eq!(voltage(bits!(4)).high_voltage, AlarmLevel::Warning);
    }

    #[test]
    fn voltage_register() {
        let protection = voltage(bits!(3, 5, 8, 13));
        assert_eq!(protection.low_voltage, AlarmLevel::Protection);
        assert_eq!(protection.low_cell_voltage, AlarmLevel::Warning);
        assert_eq!(protection.cell_imbalance, AlarmLevel::Warning);
        assert_eq!(protection.fuse_blown, AlarmLevel::Protection);
        assert_eq!(protection.high_voltage, AlarmLevel::Normal);
        // the voltage register does not feed temperature categories
        assert_eq!(protection.high_temperature, AlarmLevel::Normal);

        assert_eq!(voltage(bits!(14)).cell_imbalance, AlarmLevel::Protection);
        assert_eq!(voltage(bits!(7)).low_voltage, AlarmLevel::Warning);
        assert_eq!(voltage(bits!(1)).low_cell_voltage, AlarmLevel::Protection);
    }

    #[test]
    fn current_register() {
        let current = |current| {
            Protection::from_registers(&StatusRegisters {
                current,
                ..Default::default()
            })
        };
        assert_eq!(current(bits!(2)).high_charge_current, AlarmLevel::Protection);
        assert_eq!(current(bits!(6)).high_charge_current, AlarmLevel::Warning);
        for bit in [3, 4, 5] {
            assert_eq!(
                current(bits!(bit)).high_discharge_current,
                AlarmLevel::Protection
            );
        }
        assert_eq!(current(bits!(7)).high_discharge_current, AlarmLevel::Warning);
        assert_eq!(current(bits!(0, 1)).worst(), AlarmLevel::Normal);
    }

    #[test]
    fn temperature_register() {
        let protection = temperature(bits!(0));
        assert_eq!(protection.high_charge_temperature, AlarmLevel::Protection);
        assert_eq!(protection.high_temperature, AlarmLevel::Protection);

        let protection = temperature(bits!(2));
        assert_eq!(protection.high_charge_temperature, AlarmLevel::Normal);
        assert_eq!(protection.high_temperature, AlarmLevel::Protection);

        let protection = temperature(bits!(9, 11));
        assert_eq!(protection.low_charge_temperature, AlarmLevel::Warning);
        assert_eq!(protection.low_temperature, AlarmLevel::Warning);

        assert_eq!(temperature(bits!(3)).low_temperature, AlarmLevel::Protection);
        assert_eq!(temperature(bits!(10)).high_temperature, AlarmLevel::Warning);
        assert_eq!(
            temperature(bits!(4)).high_internal_temperature,
            AlarmLevel::Protection
        );
        assert_eq!(
            temperature(bits!(12)).high_internal_temperature,
            AlarmLevel::Warning
        );
        assert_eq!(
            temperature(bits!(14, 6)).high_internal_temperature,
            AlarmLevel::Protection
        );
    }

    #[test]
    fn warning_register() {
        let warning = |warning| {
            Protection::from_registers(&StatusRegisters {
                warning,
                ..Default::default()
            })
        };
        assert_eq!(warning(bits!(7)).low_soc, AlarmLevel::Protection);
        assert_eq!(warning(bits!(7)).internal_failure, AlarmLevel::Normal);
        assert_eq!(warning(bits!(0)).worst(), AlarmLevel::Normal);
        for bit in 1..=6 {
            assert_eq!(warning(bits!(bit)).internal_failure, AlarmLevel::Protection);
        }
        assert_eq!(warning(bits!(8, 15)).worst(), AlarmLevel::Normal);
    }

    #[test]
    fn level_by_category() {
        let protection = voltage(bits!(13));
        assert_eq!(protection.level(AlarmCategory::FuseBlown), AlarmLevel::Protection);
        assert_eq!(protection.level(AlarmCategory::LowSoc), AlarmLevel::Normal);
    }

    #[test]
    fn level_reads_the_matching_field() {
        for rule in &ALARM_RULES {
            let mut protection = Protection::default();
            *protection.level_mut(rule.category) = AlarmLevel::Warning;
            assert_eq!(protection.level(rule.category), AlarmLevel::Warning);
            let others = ALARM_RULES
                .iter()
                .filter(|other| other.category != rule.category);
            for other in others {
                assert_eq!(protection.level(other.category), AlarmLevel::Normal);
            }
        }
    }

    #[test]
    fn fet_status() {
        assert!(!FetStatus(0).charge_engaged());
        assert!(!FetStatus(0).discharge_engaged());
        assert!(FetStatus(0b01).charge_engaged());
        assert!(!FetStatus(0b01).discharge_engaged());
        assert!(FetStatus(0b11).discharge_engaged());
    }
}
