//! Fixed-position fields of a hex encoded payload.

use super::Command;
use crate::Error;

/// One field of a payload layout, positions are in characters.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Field {
    pub name: &'static str,
    pub offset: usize,
    pub width: usize,
    /// Divisor converting the raw integer into its physical unit.
    pub scale: f32,
    /// Two's complement over `width * 4` bits.
    pub signed: bool,
}

impl Field {
    pub const fn unsigned(name: &'static str, offset: usize, width: usize, scale: f32) -> Self {
        Self {
            name,
            offset,
            width,
            scale,
            signed: false,
        }
    }

    pub const fn signed(name: &'static str, offset: usize, width: usize, scale: f32) -> Self {
        Self {
            name,
            offset,
            width,
            scale,
            signed: true,
        }
    }

    pub const fn text(name: &'static str, offset: usize, width: usize) -> Self {
        Self::unsigned(name, offset, width, 1.0)
    }

    /// The same field moved `n` widths further, for repeated values.
    pub const fn nth(&self, n: usize) -> Self {
        Self {
            offset: self.offset + n * self.width,
            ..*self
        }
    }

    pub const fn end(&self) -> usize {
        self.offset + self.width
    }
}

/// Minimum payload length covering every field of `layout`.
pub(crate) const fn layout_length(layout: &[Field]) -> usize {
    let mut length = 0;
    let mut i = 0;
    while i < layout.len() {
        if layout[i].end() > length {
            length = layout[i].end();
        }
        i += 1;
    }
    length
}

/// Parses hex digits of either case. Unlike `from_str_radix` this rejects
/// signs and empty input.
pub(crate) fn parse_hex(field: &'static str, text: &str) -> Result<u32, Error> {
    if text.is_empty() || text.len() > 8 || !text.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::FieldDecode {
            field,
            value: text.to_string(),
        });
    }
    u32::from_str_radix(text, 16).map_err(|_| Error::FieldDecode {
        field,
        value: text.to_string(),
    })
}

/// Read access to a payload whose length has already been checked against
/// the layout of `command`.
#[derive(Debug)]
pub(crate) struct PayloadReader<'a> {
    payload: &'a str,
}

impl<'a> PayloadReader<'a> {
    /// Skips the command echo of `command` and requires `required`
    /// characters after it.
    pub fn new(payload: &'a str, command: Command, required: usize) -> Result<Self, Error> {
        let skip = command.echo_length();
        if !payload.is_ascii() {
            return Err(Error::FieldDecode {
                field: "payload",
                value: payload.to_string(),
            });
        }
        if payload.len() < skip + required {
            log::warn!(
                "Invalid payload size for {command} - required={} received={}",
                skip + required,
                payload.len()
            );
            return Err(Error::PayloadTooShort {
                command,
                required: skip + required,
                received: payload.len(),
            });
        }
        Ok(Self {
            payload: &payload[skip..],
        })
    }

    fn slice(&self, field: &Field) -> &'a str {
        &self.payload[field.offset..field.end()]
    }

    /// The field as an unscaled integer.
    pub fn raw(&self, field: &Field) -> Result<u32, Error> {
        parse_hex(field.name, self.slice(field))
    }

    /// The field converted to its physical unit.
    pub fn value(&self, field: &Field) -> Result<f32, Error> {
        let raw = self.raw(field)?;
        let value = if field.signed {
            let bits = field.width * 4;
            let raw = i64::from(raw);
            if raw >= 1 << (bits - 1) {
                raw - (1 << bits)
            } else {
                raw
            }
        } else {
            i64::from(raw)
        };
        let value = value as f32 / field.scale;
        log::trace!("{} = {}", field.name, value);
        Ok(value)
    }

    /// Hex encoded text with NUL padding and surrounding whitespace removed.
    pub fn text(&self, field: &Field) -> Result<String, Error> {
        let hex = self.slice(field);
        let bytes = hex
            .as_bytes()
            .chunks(2)
            .map(|pair| {
                std::str::from_utf8(pair)
                    .map_err(|_| Error::FieldDecode {
                        field: field.name,
                        value: hex.to_string(),
                    })
                    .and_then(|pair| parse_hex(field.name, pair))
                    .map(|b| b as u8)
            })
            .collect::<Result<Vec<u8>, Error>>()?;
        let text = String::from_utf8(bytes).map_err(|_| Error::FieldDecode {
            field: field.name,
            value: hex.to_string(),
        })?;
        let text = text.replace('\0', "").trim().to_string();
        log::trace!("{} = {:?}", field.name, text);
        Ok(text)
    }

    /// Pairs of hex digits joined with dots, e.g. `010203` as `01.02.03`.
    pub fn version(&self, field: &Field) -> Result<String, Error> {
        let hex = self.slice(field);
        if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::FieldDecode {
                field: field.name,
                value: hex.to_string(),
            });
        }
        let version = hex
            .as_bytes()
            .chunks(2)
            .filter_map(|pair| std::str::from_utf8(pair).ok())
            .collect::<Vec<_>>()
            .join(".");
        log::trace!("{} = {}", field.name, version);
        Ok(version)
    }
}
