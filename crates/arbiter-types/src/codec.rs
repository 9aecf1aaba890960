use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VectorCodecError {
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("decoded byte length {0} is not a multiple of 4")]
    Misaligned(usize),
    #[error("decoded vector has {got} dimensions, expected {expected}")]
    DimensionMismatch { got: usize, expected: usize },
}

/// Encode a float32 vector as base64 over its little-endian IEEE-754 bytes.
pub fn encode_vector_f32le(vector: &[f32]) -> String {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    STANDARD.encode(bytes)
}

/// Decode a `vector_b64` payload back into float32 values.
pub fn decode_vector_f32le(payload: &str) -> Result<Vec<f32>, VectorCodecError> {
    let bytes = STANDARD.decode(payload)?;
    if bytes.len() % 4 != 0 {
        return Err(VectorCodecError::Misaligned(bytes.len()));
    }
    let mut vector = Vec::with_capacity(bytes.len() / 4);
    for chunk in bytes.chunks_exact(4) {
        vector.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    Ok(vector)
}

/// Decode with a dimension check against a previously recorded value.
pub fn decode_vector_checked(
    payload: &str,
    expected_dimensions: usize,
) -> Result<Vec<f32>, VectorCodecError> {
    let vector = decode_vector_f32le(payload)?;
    if vector.len() != expected_dimensions {
        return Err(VectorCodecError::DimensionMismatch {
            got: vector.len(),
            expected: expected_dimensions,
        });
    }
    Ok(vector)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_is_bit_exact() {
        let vector = vec![0.0f32, 1.0, -1.5, f32::MIN_POSITIVE, 3.402_823e38, -0.0];
        let encoded = encode_vector_f32le(&vector);
        let decoded = decode_vector_f32le(&encoded).unwrap();
        assert_eq!(decoded.len(), vector.len());
        for (a, b) in vector.iter().zip(decoded.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn decoded_length_matches_dimensions_times_four() {
        let vector = vec![0.25f32; 16];
        let encoded = encode_vector_f32le(&vector);
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&encoded)
            .unwrap();
        assert_eq!(bytes.len(), 16 * 4);
        assert!(decode_vector_checked(&encoded, 16).is_ok());
        assert!(matches!(
            decode_vector_checked(&encoded, 8),
            Err(VectorCodecError::DimensionMismatch { got: 16, expected: 8 })
        ));
    }

    #[test]
    fn misaligned_payload_is_rejected() {
        let payload = STANDARD.encode([1u8, 2, 3]);
        assert!(matches!(
            decode_vector_f32le(&payload),
            Err(VectorCodecError::Misaligned(3))
        ));
    }
}
