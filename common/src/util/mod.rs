pub mod df;
pub mod distance;
pub mod geoarrow_lines;
pub mod logging;
pub mod polyline;
pub mod speed;
