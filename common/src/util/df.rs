use geoarrow::error::GeoArrowError;
use geoarrow::io::ipc::write_ipc;
use geoarrow::table::Table;
use polars::error::PolarsError;
use polars::frame::DataFrame;
use polars::io::SerWriter;
use polars::prelude::CsvWriter;
use std::fs::{create_dir_all, File};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    CSV,
}

pub fn write_df_to_file(
    path: PathBuf,
    format: FileType,
    mut df: DataFrame
) -> Result<(), PolarsError> {
    let mut file = prepare_file(path)?;

    match format {
        FileType::CSV => {
            CsvWriter::new(&mut file).finish(&mut df)?;
        },
    }

    Ok(())
}

pub fn write_geoarrow_to_file(
    path: PathBuf,
    table: Table
) -> Result<(), GeoArrowError> {
    let file = prepare_file(path)?;

    write_ipc(table.into_record_batch_reader(), file)?;

    Ok(())
}


pub fn prepare_file(
    path: PathBuf,
) -> Result<File, std::io::Error> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent)?;
    }

    let file = File::create(path)?;

    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use polars::df;
    use polars::prelude::{CsvReadOptions, SerReader};

    #[test]
    fn test_write_csv_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("summary.csv");
        let frame = df![
            "backend" => ["osrm", "crow-fly"],
            "succeeded" => [3u32, 4],
        ].unwrap();

        write_df_to_file(path.clone(), FileType::CSV, frame.clone()).unwrap();

        let read = CsvReadOptions::default()
            .with_has_header(true)
            .try_into_reader_with_file_path(Some(path))
            .unwrap()
            .finish()
            .unwrap();
        assert_eq!(read.shape(), frame.shape());
    }
}
