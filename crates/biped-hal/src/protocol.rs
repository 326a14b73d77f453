//! SCServo-style half-duplex packet codec.
//!
//! Instruction packet: `FF FF ID LEN INSTR PARAMS… CHK`
//! Status packet:      `FF FF ID LEN ERR PARAMS… CHK`
//!
//! `LEN` counts the bytes after itself (instruction/error byte, parameters and
//! checksum).  `CHK = !(ID + LEN + INSTR/ERR + ΣPARAMS) & 0xFF`.

use biped_types::BipedError;

// ────────────────────────────────────────────────────────────────────────────
// Constants
// ────────────────────────────────────────────────────────────────────────────

pub const HEADER: [u8; 2] = [0xFF, 0xFF];

pub const INST_PING: u8 = 1;
pub const INST_READ: u8 = 2;
pub const INST_WRITE: u8 = 3;

pub const REG_TORQUE_ENABLE: u8 = 40;
pub const REG_ACCELERATION: u8 = 41;
pub const REG_GOAL_POSITION: u8 = 42;
/// Goal PWM when the servo runs in open-loop (torque) mode.
pub const REG_GOAL_PWM: u8 = 44;
/// Start of the present position / speed / load block (2 bytes each).
pub const REG_PRESENT_POSITION: u8 = 56;
pub const TELEMETRY_LEN: u8 = 6;

pub const TICKS_PER_REV: f32 = 4096.0;
pub const CENTER_TICKS: i32 = 2048;
pub const MAX_TICKS: i32 = 4095;
/// Full-scale PWM magnitude; `±PWM_FULL_SCALE` maps to `±max_torque`.
pub const PWM_FULL_SCALE: f32 = 1000.0;

/// Header + ID + LEN + ERR + CHK.
const STATUS_OVERHEAD: usize = 6;

// ────────────────────────────────────────────────────────────────────────────
// Frames
// ────────────────────────────────────────────────────────────────────────────

/// One encoded instruction addressed to a single servo, plus the length of
/// the status reply it provokes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServoFrame {
    pub address: u8,
    pub bytes: Vec<u8>,
    pub reply_len: usize,
}

/// A decoded, checksum-verified status packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusPacket {
    pub id: u8,
    /// Servo error bits (voltage, angle, overheat, …).  Zero when healthy.
    pub error: u8,
    pub params: Vec<u8>,
}

/// Checksum over `ID LEN INSTR/ERR PARAMS…`.
pub fn checksum(body: &[u8]) -> u8 {
    let sum = body.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    !sum
}

fn encode(id: u8, code: u8, params: &[u8]) -> Vec<u8> {
    let len = (params.len() + 2) as u8;
    let mut out = Vec::with_capacity(params.len() + STATUS_OVERHEAD);
    out.extend_from_slice(&HEADER);
    out.push(id);
    out.push(len);
    out.push(code);
    out.extend_from_slice(params);
    out.push(checksum(&out[2..]));
    out
}

/// Encode an instruction packet.
pub fn encode_instruction(id: u8, instruction: u8, params: &[u8]) -> Vec<u8> {
    encode(id, instruction, params)
}

/// Encode a status packet.  Used by the simulated servo chain.
pub fn encode_status(id: u8, error: u8, params: &[u8]) -> Vec<u8> {
    encode(id, error, params)
}

/// Total length of a status packet carrying `param_len` parameter bytes.
pub const fn status_len(param_len: usize) -> usize {
    STATUS_OVERHEAD + param_len
}

/// Split a packet into `(id, code, params)` after checking framing and
/// checksum.
fn decode(bytes: &[u8]) -> Result<(u8, u8, &[u8]), BipedError> {
    if bytes.len() < STATUS_OVERHEAD {
        return Err(BipedError::MalformedFrame(format!(
            "{} byte(s) is shorter than the minimum packet",
            bytes.len()
        )));
    }
    if bytes[..2] != HEADER {
        return Err(BipedError::MalformedFrame(format!(
            "bad header {:02X} {:02X}",
            bytes[0], bytes[1]
        )));
    }
    let id = bytes[2];
    let len = bytes[3] as usize;
    if len < 2 || bytes.len() != 4 + len {
        return Err(BipedError::MalformedFrame(format!(
            "length field {len} does not match {} byte packet",
            bytes.len()
        )));
    }
    let last = bytes.len() - 1;
    let expected = checksum(&bytes[2..last]);
    if bytes[last] != expected {
        return Err(BipedError::Checksum {
            address: id,
            expected,
            actual: bytes[last],
        });
    }
    Ok((id, bytes[4], &bytes[5..last]))
}

/// Decode and verify a status packet from `expected_id`.
pub fn decode_status(bytes: &[u8], expected_id: u8) -> Result<StatusPacket, BipedError> {
    let (id, error, params) = decode(bytes)?;
    if id != expected_id {
        return Err(BipedError::MalformedFrame(format!(
            "reply from address {id}, expected {expected_id}"
        )));
    }
    Ok(StatusPacket {
        id,
        error,
        params: params.to_vec(),
    })
}

/// Decode an instruction packet into `(id, instruction, params)`.
pub fn decode_instruction(bytes: &[u8]) -> Result<(u8, u8, Vec<u8>), BipedError> {
    let (id, instruction, params) = decode(bytes)?;
    Ok((id, instruction, params.to_vec()))
}

// ────────────────────────────────────────────────────────────────────────────
// Register value helpers
// ────────────────────────────────────────────────────────────────────────────

/// Encode a signed register value: bit 15 is the sign, bits 0–14 the
/// magnitude.
pub fn to_sign_magnitude(value: i16) -> u16 {
    let magnitude = value.unsigned_abs().min(0x7FFF);
    if value < 0 {
        magnitude | 0x8000
    } else {
        magnitude
    }
}

pub fn from_sign_magnitude(raw: u16) -> i16 {
    let magnitude = (raw & 0x7FFF) as i16;
    if raw & 0x8000 != 0 { -magnitude } else { magnitude }
}

/// Little-endian u16 at `offset`.
pub fn read_u16(params: &[u8], offset: usize) -> Result<u16, BipedError> {
    match params.get(offset..offset + 2) {
        Some(b) => Ok(u16::from_le_bytes([b[0], b[1]])),
        None => Err(BipedError::MalformedFrame(format!(
            "register offset {offset} beyond {} byte payload",
            params.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_packet_matches_reference_bytes() {
        // FF FF 01 02 01 FB
        assert_eq!(
            encode_instruction(1, INST_PING, &[]),
            vec![0xFF, 0xFF, 0x01, 0x02, 0x01, 0xFB]
        );
    }

    #[test]
    fn status_roundtrip() {
        let bytes = encode_status(7, 0, &[0x00, 0x08, 0x10, 0x00, 0x05, 0x80]);
        assert_eq!(bytes.len(), status_len(6));
        let pkt = decode_status(&bytes, 7).unwrap();
        assert_eq!(pkt.params.len(), 6);
        assert_eq!(read_u16(&pkt.params, 0).unwrap(), 2048);
    }

    #[test]
    fn corrupted_checksum_is_detected() {
        let mut bytes = encode_status(3, 0, &[1, 2]);
        let last = bytes.len() - 1;
        bytes[last] ^= 0x5A;
        assert!(matches!(
            decode_status(&bytes, 3),
            Err(BipedError::Checksum { address: 3, .. })
        ));
    }

    #[test]
    fn wrong_sender_and_short_frames_are_malformed() {
        let bytes = encode_status(3, 0, &[]);
        assert!(matches!(
            decode_status(&bytes, 4),
            Err(BipedError::MalformedFrame(_))
        ));
        assert!(matches!(
            decode_status(&bytes[..4], 3),
            Err(BipedError::MalformedFrame(_))
        ));
    }

    #[test]
    fn sign_magnitude() {
        assert_eq!(to_sign_magnitude(-5), 0x8005);
        assert_eq!(from_sign_magnitude(0x8005), -5);
        assert_eq!(from_sign_magnitude(to_sign_magnitude(1200)), 1200);
    }

    #[test]
    fn instruction_decodes() {
        let bytes = encode_instruction(9, INST_WRITE, &[REG_TORQUE_ENABLE, 0]);
        let (id, inst, params) = decode_instruction(&bytes).unwrap();
        assert_eq!((id, inst), (9, INST_WRITE));
        assert_eq!(params, vec![REG_TORQUE_ENABLE, 0]);
    }
}
