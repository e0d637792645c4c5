use arrow_array::{ArrayRef, Float64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{ArrowError, DataType, Field, FieldRef, Schema, SchemaRef};
use geo::LineString;
use geoarrow::array::LineStringBuilder;
use geoarrow::datatypes::Dimension;
use geoarrow::error::GeoArrowError;
use geoarrow::table::Table;
use geoarrow::ArrayBase;
use std::fmt::Display;
use std::sync::Arc;

/// A non-geometry column of a line table, one value per line
pub enum LineColumn {
    Text(String, Vec<String>),
    Count(String, Vec<u32>),
    Number(String, Vec<Option<f64>>),
}

impl LineColumn {
    fn len(&self) -> usize {
        match self {
            LineColumn::Text(_, values) => values.len(),
            LineColumn::Count(_, values) => values.len(),
            LineColumn::Number(_, values) => values.len(),
        }
    }

    fn into_arrow(self) -> (FieldRef, ArrayRef) {
        match self {
            LineColumn::Text(name, values) => (
                Arc::new(Field::new(name, DataType::Utf8, false)),
                Arc::new(StringArray::from(values)) as ArrayRef,
            ),
            LineColumn::Count(name, values) => (
                Arc::new(Field::new(name, DataType::UInt32, false)),
                Arc::new(UInt32Array::from(values)) as ArrayRef,
            ),
            LineColumn::Number(name, values) => (
                Arc::new(Field::new(name, DataType::Float64, true)),
                Arc::new(Float64Array::from(values)) as ArrayRef,
            ),
        }
    }
}

/// Builds a GeoArrow table with a line string geometry column (last) and the given columns
pub fn build_geoarrow_lines(
    lines: Vec<LineString<f64>>,
    columns: Vec<LineColumn>,
) -> Result<Table, Error> {
    let mut builder: LineStringBuilder = LineStringBuilder::new(Dimension::XY);

    for line in &lines {
        builder.push_line_string(Some(line))?
    }

    let mut fields: Vec<FieldRef> = Vec::with_capacity(columns.len() + 1);
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(columns.len() + 1);
    for column in columns {
        if column.len() != lines.len() {
            return Err(Error::ColumnLength { expected: lines.len(), actual: column.len() });
        }
        let (field, array) = column.into_arrow();
        fields.push(field);
        arrays.push(array);
    }

    let array = builder.finish();
    let geometry_field: FieldRef = array.extension_field().into();
    fields.push(geometry_field);
    arrays.push(array.into_array_ref());

    let schema: SchemaRef = Schema::new(fields).into();
    let batch = RecordBatch::try_new(schema.clone(), arrays)?;
    let table = Table::try_new(vec![batch], schema)?;

    Ok(table)
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    Geoarrow(#[from] GeoArrowError),
    Arrow(#[from] ArrowError),
    ColumnLength { expected: usize, actual: usize },
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Geoarrow(e) => e.fmt(f),
            Error::Arrow(e) => e.fmt(f),
            Error::ColumnLength { expected, actual } => {
                write!(f, "Column has {actual} values, but there are {expected} lines")
            }
        }
    }
}
