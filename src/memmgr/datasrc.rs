//! Data source configuration snapshots and generations
//!
//! Each accepted data source reconfiguration produces one `DataSrcInfo`
//! with the next generation id. The mapping inside a generation never
//! changes after construction; only the newest generation takes new load
//! events, while older ones stick around for readers still attached to
//! their segments.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::Path;

use serde_derive::Deserialize;
use serde_json::Value;

use crate::memmgr::segment::SegmentId;
use crate::memmgr::segment_info::SegmentInfo;
use crate::memmgr::types::RRClass;

#[derive(Debug)]
pub enum DataSrcError {
    BadClass(String),
    DuplicateName(RRClass, String),
    BadSpec(serde_json::Error),
}

impl fmt::Display for DataSrcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataSrcError::BadClass(mnemonic) => write!(f, "bad class: {}", mnemonic),
            DataSrcError::DuplicateName(class, name) => {
                write!(f, "duplicate data source {}/{}", class, name)
            }
            DataSrcError::BadSpec(e) => write!(f, "bad data source specification: {}", e),
        }
    }
}

impl std::error::Error for DataSrcError {}

impl From<serde_json::Error> for DataSrcError {
    fn from(err: serde_json::Error) -> Self {
        DataSrcError::BadSpec(err)
    }
}

type Result<T> = std::result::Result<T, DataSrcError>;

const CACHE_TYPE_MAPPED: &str = "mapped";

#[derive(Debug, Deserialize)]
pub struct DataSrcConfig {
    pub classes: BTreeMap<String, Vec<DataSrcSpec>>,
}

#[derive(Debug, Deserialize)]
pub struct DataSrcSpec {
    #[serde(rename = "type")]
    pub backend: String,
    /// Defaults to the backend type when absent.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "cache-enable", default)]
    pub cache_enable: bool,
    #[serde(rename = "cache-type", default = "default_cache_type")]
    pub cache_type: String,
    #[serde(default)]
    pub params: Value,
}

fn default_cache_type() -> String {
    "local".to_string()
}

impl DataSrcSpec {
    fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.backend)
    }
}

pub fn parse_config(value: &Value) -> Result<DataSrcConfig> {
    Ok(serde_json::from_value(value.clone())?)
}

/// One generation of configured data sources.
#[derive(Debug)]
pub struct DataSrcInfo {
    gen_id: u64,
    segments: HashMap<(RRClass, String), SegmentInfo>,
    /// Cache-enabled sources kept in process-local memory. They have no
    /// segments to manage, but zone update notifications for them must be
    /// recognized rather than treated as unknown sources.
    locals: HashSet<(RRClass, String)>,
}

impl DataSrcInfo {
    pub fn build(gen_id: u64, config: &DataSrcConfig, mapped_dir: &Path) -> Result<DataSrcInfo> {
        let mut segments = HashMap::new();
        let mut locals = HashSet::new();
        for (mnemonic, specs) in &config.classes {
            let class: RRClass = mnemonic
                .parse()
                .map_err(|_| DataSrcError::BadClass(mnemonic.clone()))?;
            for spec in specs {
                if !spec.cache_enable {
                    continue;
                }
                let key = (class, spec.name().to_string());
                if spec.cache_type != CACHE_TYPE_MAPPED {
                    locals.insert(key);
                    continue;
                }
                if segments.contains_key(&key) || locals.contains(&key) {
                    return Err(DataSrcError::DuplicateName(class, key.1));
                }
                let id = SegmentId {
                    gen_id,
                    class,
                    datasrc: key.1.clone(),
                };
                segments.insert(key, SegmentInfo::new(id, mapped_dir));
            }
        }
        Ok(DataSrcInfo {
            gen_id,
            segments,
            locals,
        })
    }

    pub fn gen_id(&self) -> u64 {
        self.gen_id
    }

    pub fn segment(&self, class: RRClass, datasrc: &str) -> Option<&SegmentInfo> {
        self.segments.get(&(class, datasrc.to_string()))
    }

    pub fn segment_mut(&mut self, class: RRClass, datasrc: &str) -> Option<&mut SegmentInfo> {
        self.segments.get_mut(&(class, datasrc.to_string()))
    }

    pub fn segments(&self) -> impl Iterator<Item = &SegmentInfo> {
        self.segments.values()
    }

    pub fn segments_mut(&mut self) -> impl Iterator<Item = &mut SegmentInfo> {
        self.segments.values_mut()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn has_local(&self, class: RRClass, datasrc: &str) -> bool {
        self.locals.contains(&(class, datasrc.to_string()))
    }
}
