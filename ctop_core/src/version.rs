use std::fmt;

use serde::Serialize;

use crate::cpuid::{bits, leaf, CpuidOracle, Registers};
use crate::error::{Result, TopologyError};

// leaf 1, EAX
const STEPPING_OFFSET: u32 = 0;
const STEPPING_WIDTH: u32 = 4;
const MODEL_OFFSET: u32 = 4;
const MODEL_WIDTH: u32 = 4;
const FAMILY_OFFSET: u32 = 8;
const FAMILY_WIDTH: u32 = 4;
const TYPE_OFFSET: u32 = 12;
const TYPE_WIDTH: u32 = 2;
const EXT_MODEL_OFFSET: u32 = 16;
const EXT_MODEL_WIDTH: u32 = 4;
const EXT_FAMILY_OFFSET: u32 = 20;
const EXT_FAMILY_WIDTH: u32 = 8;

pub const BRAND_LENGTH: usize = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Vendor {
    Intel,
    Amd,
    Unknown,
}

impl Vendor {
    /// Classify the 12-byte vendor id
    pub fn from_id(id: &[u8]) -> Self {
        match id {
            b"GenuineIntel" => Vendor::Intel,
            b"AuthenticAMD" => Vendor::Amd,
            _ => Vendor::Unknown,
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Vendor::Intel => write!(f, "Intel"),
            Vendor::Amd => write!(f, "AMD"),
            Vendor::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProcessorType {
    OriginalOem,
    Overdrive,
    DualProcessor,
    Reserved,
}

impl ProcessorType {
    fn from_bits(value: u32) -> Self {
        match value & 0x3 {
            0 => ProcessorType::OriginalOem,
            1 => ProcessorType::Overdrive,
            2 => ProcessorType::DualProcessor,
            _ => ProcessorType::Reserved,
        }
    }
}

impl fmt::Display for ProcessorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessorType::OriginalOem => write!(f, "Original OEM"),
            ProcessorType::Overdrive => write!(f, "Intel OverDrive"),
            ProcessorType::DualProcessor => write!(f, "Dual Processor"),
            ProcessorType::Reserved => write!(f, "Reserved"),
        }
    }
}

/// Processor identity decoded from leaves 0, 1 and the brand string leaves
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CpuVersion {
    vendor: Vendor,
    family: u32,
    model: u32,
    stepping: u32,
    processor_type: ProcessorType,
    base_frequency_mhz: f64,
    brand: String,
}

impl CpuVersion {
    pub fn vendor(&self) -> Vendor {
        self.vendor
    }

    pub fn family(&self) -> u32 {
        self.family
    }

    pub fn model(&self) -> u32 {
        self.model
    }

    pub fn stepping(&self) -> u32 {
        self.stepping
    }

    pub fn processor_type(&self) -> ProcessorType {
        self.processor_type
    }

    /// Base clock parsed from the brand string, in MHz
    pub fn base_frequency_mhz(&self) -> f64 {
        self.base_frequency_mhz
    }

    /// Brand string without leading spaces or NUL padding
    pub fn brand(&self) -> &str {
        &self.brand
    }
}

impl fmt::Display for CpuVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}), family {:#X}, model {:#X}, stepping {}, {}, base {} MHz",
            self.brand,
            self.vendor,
            self.family,
            self.model,
            self.stepping,
            self.processor_type,
            self.base_frequency_mhz
        )
    }
}

/// Family, model, stepping and type fields of leaf 1 EAX
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    pub family: u32,
    pub model: u32,
    pub stepping: u32,
    pub processor_type: ProcessorType,
}

/// Apply the extended family/model rules to a leaf 1 EAX value
pub fn decode_signature(eax: u32) -> Signature {
    let stepping = bits(eax, STEPPING_OFFSET, STEPPING_WIDTH);
    let model = bits(eax, MODEL_OFFSET, MODEL_WIDTH);
    let family = bits(eax, FAMILY_OFFSET, FAMILY_WIDTH);
    let processor_type = ProcessorType::from_bits(bits(eax, TYPE_OFFSET, TYPE_WIDTH));
    let ext_model = bits(eax, EXT_MODEL_OFFSET, EXT_MODEL_WIDTH);
    let ext_family = bits(eax, EXT_FAMILY_OFFSET, EXT_FAMILY_WIDTH);

    let final_family = if family != 0xF { family } else { ext_family + family };
    let final_model = if family == 0x6 || family == 0xF {
        (ext_model << 4) + model
    } else {
        model
    };

    Signature {
        family: final_family,
        model: final_model,
        stepping,
        processor_type,
    }
}

fn vendor_id(regs: &Registers) -> [u8; 12] {
    let mut id = [0u8; 12];
    // vendor string is spread over EBX, EDX, ECX in that order
    id[0..4].copy_from_slice(&regs.ebx.to_le_bytes());
    id[4..8].copy_from_slice(&regs.edx.to_le_bytes());
    id[8..12].copy_from_slice(&regs.ecx.to_le_bytes());
    id
}

/// Assemble the 48-byte brand buffer from the three brand string leaves
pub fn brand_buffer(parts: &[Registers; 3]) -> [u8; BRAND_LENGTH] {
    let mut buf = [0u8; BRAND_LENGTH];
    for (i, regs) in parts.iter().enumerate() {
        for (j, word) in [regs.eax, regs.ebx, regs.ecx, regs.edx].iter().enumerate() {
            let at = i * 16 + j * 4;
            buf[at..at + 4].copy_from_slice(&word.to_le_bytes());
        }
    }
    buf
}

/// Validate a raw brand buffer and return the trimmed brand text
pub fn parse_brand(buf: &[u8; BRAND_LENGTH]) -> Result<String> {
    let start = buf
        .iter()
        .position(|&c| c != b' ')
        .ok_or_else(|| TopologyError::brand("brand string is blank"))?;
    if buf[BRAND_LENGTH - 1] != 0 {
        return Err(TopologyError::brand("brand string is not null-terminated"));
    }

    let body = &buf[start..];
    let end = body.iter().position(|&c| c == 0).unwrap_or(body.len());
    let raw = &body[..end];
    if !raw.is_ascii() {
        return Err(TopologyError::brand("brand string is not ASCII"));
    }
    let text = std::str::from_utf8(raw)
        .map_err(|_| TopologyError::brand("brand string is not ASCII"))?
        .trim_end();
    if text.is_empty() {
        return Err(TopologyError::brand("brand string is blank"));
    }
    Ok(text.to_string())
}

/// Parse the trailing "<number><unit>Hz" token of a brand string into MHz
pub fn parse_base_frequency(brand: &str) -> Result<f64> {
    if brand.len() < 5 {
        return Err(TopologyError::brand("brand string too short"));
    }
    let token_start = brand
        .rfind(' ')
        .ok_or_else(|| TopologyError::brand("brand string has no spaces"))?
        + 1;
    let token = &brand[token_start..];
    if token.len() <= 3 {
        return Err(TopologyError::brand(format!(
            "frequency token {token:?} has no numeric part"
        )));
    }
    if !token.is_char_boundary(token.len() - 3) {
        return Err(TopologyError::brand(format!(
            "unrecognized frequency unit in {token:?}"
        )));
    }

    let (number, unit) = token.split_at(token.len() - 3);
    let scale = match unit {
        "MHz" => 1.0,
        "GHz" => 1_000.0,
        "THz" => 1_000_000.0,
        _ => {
            return Err(TopologyError::brand(format!(
                "unrecognized frequency unit {unit:?}"
            )))
        }
    };
    let value: f64 = number
        .parse()
        .map_err(|_| TopologyError::brand(format!("failed to parse base frequency {number:?}")))?;
    if value == 0.0 || !value.is_finite() {
        return Err(TopologyError::brand(format!("invalid base frequency {number:?}")));
    }
    Ok(value * scale)
}

/// Read vendor, signature and brand string
pub fn decode_version<O: CpuidOracle + ?Sized>(cpuid: &O) -> Result<CpuVersion> {
    cpuid.require_leaf(leaf::VERSION_INFO)?;

    let vendor = Vendor::from_id(&vendor_id(&cpuid.identify(leaf::BASIC_INFO, 0)));
    let sig = decode_signature(cpuid.identify(leaf::VERSION_INFO, 0).eax);

    cpuid.require_leaf(leaf::BRAND_STRING_3)?;
    let parts = [
        cpuid.identify(leaf::BRAND_STRING_1, 0),
        cpuid.identify(leaf::BRAND_STRING_2, 0),
        cpuid.identify(leaf::BRAND_STRING_3, 0),
    ];
    let brand = parse_brand(&brand_buffer(&parts))?;
    let base_frequency_mhz = parse_base_frequency(&brand)?;

    log::debug!(
        "decoded {} family {:#x} model {:#x} stepping {}: {:?}",
        vendor,
        sig.family,
        sig.model,
        sig.stepping,
        brand
    );

    Ok(CpuVersion {
        vendor,
        family: sig.family,
        model: sig.model,
        stepping: sig.stepping,
        processor_type: sig.processor_type,
        base_frequency_mhz,
        brand,
    })
}
