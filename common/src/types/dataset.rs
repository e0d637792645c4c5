use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use url::Url;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Dataset {
    pub id: String,
    pub src: DataSource,
    /// Inferred from the file extension if not set
    pub format: Option<DatasetFormat>,
    #[serde(default)]
    pub columns: DatasetColumns,
    /// Only keep the first `limit` valid pairs
    pub limit: Option<usize>,
}

impl Dataset {
    /// Builds a dataset from a path or URL as given on the command line. The id is the file stem.
    pub fn from_location(location: &str) -> Self {
        let src = DataSource::from_location(location);
        let id = match &src {
            DataSource::URL { url, .. } => url
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .and_then(|name| Path::new(name).file_stem())
                .and_then(|stem| stem.to_str())
                .unwrap_or("remote")
                .to_string(),
            DataSource::File { path } => Path::new(path)
                .file_stem()
                .and_then(|stem| stem.to_str())
                .unwrap_or("local")
                .to_string(),
        };

        Self {
            id,
            src,
            format: None,
            columns: DatasetColumns::default(),
            limit: None,
        }
    }

    pub fn resolved_format(&self) -> Option<DatasetFormat> {
        self.format.clone().or_else(|| match &self.src {
            DataSource::URL { url, .. } => DatasetFormat::from_extension(url.path()),
            DataSource::File { path } => DatasetFormat::from_extension(path),
        })
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub enum DatasetFormat {
    #[serde(rename = "csv")]
    Csv,
    #[serde(rename = "geojson")]
    GeoJson,
}

impl DatasetFormat {
    pub fn from_extension(path: &str) -> Option<Self> {
        let extension = Path::new(path).extension()?.to_str()?.to_ascii_lowercase();
        match extension.as_str() {
            "csv" => Some(DatasetFormat::Csv),
            "geojson" | "json" => Some(DatasetFormat::GeoJson),
            _ => None,
        }
    }
}

/// Names of the columns (CSV) or feature properties (GeoJSON) holding the pair data. The
/// coordinate columns are only read for CSV, GeoJSON takes them from the desire line geometry.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct DatasetColumns {
    pub origin_id: String,
    pub destination_id: String,
    pub origin_lon: String,
    pub origin_lat: String,
    pub destination_lon: String,
    pub destination_lat: String,
    pub weight: String,
}

impl Default for DatasetColumns {
    fn default() -> Self {
        Self {
            origin_id: "O".into(),
            destination_id: "D".into(),
            origin_lon: "o_lon".into(),
            origin_lat: "o_lat".into(),
            destination_lon: "d_lon".into(),
            destination_lat: "d_lat".into(),
            weight: "all".into(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(
    untagged,
    expecting = "Invalid or missing data source. Specify either a remote source with `url:` and `headers:` or a local path with `file:` under `src:` of this dataset")
]
pub enum DataSource {
    URL {
        url: Url,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    File {
        path: String
    }
}

impl DataSource {
    pub fn from_location(location: &str) -> Self {
        match Url::parse(location) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => DataSource::URL {
                url,
                headers: HashMap::new(),
            },
            _ => DataSource::File { path: location.to_string() },
        }
    }
}
