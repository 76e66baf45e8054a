//! Populating writable segments from data sources
//!
//! The manager and builder only know the `ZoneLoader` seam. The file
//! image loader shipped here snapshots zone master files into a single
//! image file per segment; a production deployment can plug in a loader
//! for whatever backend actually holds its zones.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;

use chrono::Utc;

use crate::memmgr::segment::SegmentParams;
use crate::memmgr::types::{RRClass, ZoneName};

#[derive(Debug)]
pub enum LoaderError {
    Io(io::Error),
    ZoneNotFound(String),
    BadImage(String),
}

impl fmt::Display for LoaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoaderError::Io(e) => write!(f, "IO error: {}", e),
            LoaderError::ZoneNotFound(zone) => write!(f, "zone not found: {}", zone),
            LoaderError::BadImage(reason) => write!(f, "bad segment image: {}", reason),
        }
    }
}

impl std::error::Error for LoaderError {}

impl From<io::Error> for LoaderError {
    fn from(err: io::Error) -> Self {
        LoaderError::Io(err)
    }
}

type Result<T> = std::result::Result<T, LoaderError>;

/// Fills a writable segment with zone data.
///
/// A `None` zone means every zone the data source defines. The builder
/// thread is the only caller, so implementations may block on I/O freely.
pub trait ZoneLoader: Send + Sync {
    fn load(
        &self,
        zone: Option<&ZoneName>,
        class: RRClass,
        datasrc: &str,
        params: &SegmentParams,
    ) -> Result<()>;
}

const IMAGE_MAGIC: &[u8; 4] = b"SIMG";
const IMAGE_FORMAT: u16 = 1;

/// Loads zones from per-zone master files on disk.
///
/// Sources live under `<zones_dir>/<datasrc>/<class>/<zone name>`; the
/// image written into the segment file is a flat snapshot of those files
/// stamped with the build time.
pub struct FileImageLoader {
    zones_dir: PathBuf,
}

impl FileImageLoader {
    pub fn new(zones_dir: PathBuf) -> FileImageLoader {
        FileImageLoader { zones_dir }
    }

    fn source_dir(&self, class: RRClass, datasrc: &str) -> PathBuf {
        self.zones_dir.join(datasrc).join(class.to_string())
    }

    fn load_all(&self, class: RRClass, datasrc: &str) -> Result<BTreeMap<String, Vec<u8>>> {
        let mut zones = BTreeMap::new();
        let dir = match self.source_dir(class, datasrc).read_dir() {
            Ok(dir) => dir,
            // A source with no zone files yet yields an empty table.
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(zones),
            Err(e) => return Err(e.into()),
        };
        for entry in dir {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            zones.insert(name, fs::read(entry.path())?);
        }
        Ok(zones)
    }
}

impl ZoneLoader for FileImageLoader {
    fn load(
        &self,
        zone: Option<&ZoneName>,
        class: RRClass,
        datasrc: &str,
        params: &SegmentParams,
    ) -> Result<()> {
        let zones = match zone {
            None => self.load_all(class, datasrc)?,
            Some(zone) => {
                let source = self.source_dir(class, datasrc).join(zone.as_str());
                let data = match fs::read(&source) {
                    Ok(data) => data,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        return Err(LoaderError::ZoneNotFound(zone.to_string()))
                    }
                    Err(e) => return Err(e.into()),
                };
                let mut zones = read_image(&params.mapped_file)?;
                zones.insert(zone.as_str().to_string(), data);
                zones
            }
        };
        write_image(&params.mapped_file, &zones)
    }
}

fn write_image(path: &std::path::Path, zones: &BTreeMap<String, Vec<u8>>) -> Result<()> {
    let mut buffer = Vec::new();
    buffer.extend_from_slice(IMAGE_MAGIC);
    buffer.extend_from_slice(&IMAGE_FORMAT.to_be_bytes());
    buffer.extend_from_slice(&Utc::now().timestamp().to_be_bytes());
    buffer.extend_from_slice(&(zones.len() as u32).to_be_bytes());
    for (name, data) in zones {
        buffer.extend_from_slice(&(name.len() as u16).to_be_bytes());
        buffer.extend_from_slice(name.as_bytes());
        buffer.extend_from_slice(&(data.len() as u32).to_be_bytes());
        buffer.extend_from_slice(data);
    }

    let mut file = fs::File::create(path)?;
    file.write_all(&buffer)?;
    Ok(())
}

/// Read an image back into its zone table. A file that does not exist
/// yet reads as empty, so a single-zone load can seed a fresh segment.
fn read_image(path: &std::path::Path) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut file = match fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(e.into()),
    };

    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)?;
    if &magic != IMAGE_MAGIC {
        return Err(LoaderError::BadImage("magic mismatch".to_string()));
    }
    let format = read_u16(&mut file)?;
    if format != IMAGE_FORMAT {
        return Err(LoaderError::BadImage(format!("unknown format {}", format)));
    }
    let mut timestamp = [0u8; 8];
    file.read_exact(&mut timestamp)?;

    let count = read_u32(&mut file)?;
    let mut zones = BTreeMap::new();
    for _ in 0..count {
        let name_len = read_u16(&mut file)? as usize;
        let mut name = vec![0u8; name_len];
        file.read_exact(&mut name)?;
        let name = String::from_utf8(name)
            .map_err(|_| LoaderError::BadImage("zone name is not UTF-8".to_string()))?;

        let data_len = read_u32(&mut file)? as usize;
        let mut data = vec![0u8; data_len];
        file.read_exact(&mut data)?;
        zones.insert(name, data);
    }
    Ok(zones)
}

fn read_u16<R: Read>(reader: &mut R) -> io::Result<u16> {
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf)?;
    Ok(u16::from_be_bytes(buf))
}

fn read_u32<R: Read>(reader: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}
