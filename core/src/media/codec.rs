//! G.711 mu-law (PCMU) helpers for the call audio path

/// PCMU clock rate.
pub const PCMU_RATE: u32 = 8_000;
/// Samples per 20 ms PCMU packet.
pub const PCMU_FRAME: usize = 160;

const BIAS: i32 = 0x84;
const CLIP: i32 = 32_635;

pub fn encode_sample(sample: i16) -> u8 {
    let mut pcm = sample as i32;
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0
    };
    pcm = pcm.min(CLIP) + BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && pcm & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (pcm >> (exponent + 3)) & 0x0F;

    !(sign | (exponent << 4) | mantissa) as u8
}

pub fn decode_sample(byte: u8) -> i16 {
    let byte = !byte as i32;
    let sign = byte & 0x80;
    let exponent = (byte >> 4) & 0x07;
    let mantissa = byte & 0x0F;

    let magnitude = (((mantissa << 3) + BIAS) << exponent) - BIAS;
    if sign != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

pub fn encode(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .map(|s| encode_sample((s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16))
        .collect()
}

pub fn decode(payload: &[u8]) -> Vec<f32> {
    payload
        .iter()
        .map(|b| decode_sample(*b) as f32 / i16::MAX as f32)
        .collect()
}

/// Cuts a continuous sample stream into fixed-size packets.
#[derive(Debug, Default)]
pub struct Packetizer {
    pending: Vec<f32>,
}

impl Packetizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        self.pending.extend_from_slice(samples);
        let mut packets = Vec::new();
        while self.pending.len() >= PCMU_FRAME {
            packets.push(self.pending.drain(..PCMU_FRAME).collect());
        }
        packets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_encodes_to_0xff() {
        assert_eq!(encode_sample(0), 0xFF);
        assert_eq!(decode_sample(0xFF), 0);
    }

    #[test]
    fn test_mulaw_error_is_bounded() {
        for sample in [-32_000_i16, -8_000, -1_000, -50, 50, 1_000, 8_000, 32_000] {
            let decoded = decode_sample(encode_sample(sample));
            let error = (decoded as i32 - sample as i32).abs();
            assert!(
                error <= (sample as i32).abs() / 8 + 16,
                "sample {} decoded to {}",
                sample,
                decoded
            );
            assert_eq!(decoded.signum(), sample.signum());
        }
    }

    #[test]
    fn test_packetizer_carries_remainder() {
        let mut packetizer = Packetizer::new();
        assert!(packetizer.push(&[0.0; 100]).is_empty());
        let packets = packetizer.push(&[0.0; 300]);
        assert_eq!(packets.len(), 2);
        assert!(packets.iter().all(|p| p.len() == PCMU_FRAME));
        assert_eq!(packetizer.push(&[0.0; 79]).len(), 0);
        assert_eq!(packetizer.push(&[0.0; 1]).len(), 1);
    }
}
