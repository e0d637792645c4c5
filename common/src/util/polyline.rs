use geo::{coord, LineString};
use std::fmt::{Display, Formatter};

/// Decodes an encoded polyline (as used by Valhalla with precision 6, or Google/OSRM with
/// precision 5) into a line string with x = lon and y = lat.
pub fn decode(encoded: &str, precision: u32) -> Result<LineString<f64>, PolylineError> {
    let factor = 10_f64.powi(precision as i32);
    let bytes = encoded.as_bytes();

    let mut coordinates = Vec::new();
    let mut index = 0;
    let mut lat: i64 = 0;
    let mut lon: i64 = 0;

    while index < bytes.len() {
        let (delta_lat, next) = decode_value(bytes, index)?;
        let (delta_lon, next) = decode_value(bytes, next)?;
        index = next;

        lat += delta_lat;
        lon += delta_lon;
        coordinates.push(coord! { x: lon as f64 / factor, y: lat as f64 / factor });
    }

    Ok(LineString::new(coordinates))
}

fn decode_value(bytes: &[u8], mut index: usize) -> Result<(i64, usize), PolylineError> {
    let mut result: i64 = 0;
    let mut shift = 0;

    loop {
        let Some(byte) = bytes.get(index) else { return Err(PolylineError::Truncated(index)) };
        let chunk = (*byte as i64) - 63;
        if !(0..64).contains(&chunk) || shift > 60 {
            return Err(PolylineError::InvalidCharacter(index));
        }
        index += 1;

        result |= (chunk & 0x1f) << shift;
        shift += 5;

        if chunk < 0x20 {
            break;
        }
    }

    let value = if result & 1 == 1 { !(result >> 1) } else { result >> 1 };
    Ok((value, index))
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum PolylineError {
    InvalidCharacter(usize),
    Truncated(usize),
}

impl Display for PolylineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PolylineError::InvalidCharacter(at) => write!(f, "Invalid character in polyline at {at}"),
            PolylineError::Truncated(at) => write!(f, "Polyline ends unexpectedly at {at}"),
        }
    }
}
