//! The mount table.
//!
//! One whitespace-separated line per mount:
//! `<uuid> <mount path> <prefix> <uid> <gid> <options,csv> <store> <replicate>`.
//! Comment lines begin with `#`; a header comment records the last save and
//! its absence is tolerated.

use std::path::{Path, PathBuf};

use chrono::Utc;
use fluid_core::error::{Error, Result};
use uuid::Uuid;

const FSTAB_HEADER: &str = "# FluidFS fstab config last updated:";

/// Placeholder written when a mount carries no options.
const NO_OPTIONS: &str = "defaults";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    pub uuid: Uuid,
    pub path: PathBuf,
    pub prefix: String,
    pub uid: u32,
    pub gid: u32,
    pub options: Vec<String>,
    /// Whether writes through this mount are chunked and stored.
    pub store: bool,
    /// Whether this mount's blobs participate in anti-entropy.
    pub replicate: bool,
}

impl MountPoint {
    pub fn new(path: PathBuf, prefix: String, uid: u32, gid: u32) -> MountPoint {
        MountPoint {
            uuid: Uuid::new_v4(),
            path,
            prefix,
            uid,
            gid,
            options: Vec::new(),
            store: true,
            replicate: true,
        }
    }

    pub fn read_only(&self) -> bool {
        self.options.iter().any(|opt| opt == "ro")
    }

    fn parse_line(line: &str) -> Result<MountPoint> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 8 {
            return Err(Error::Config(format!(
                "fstab line has {} fields, expected 8: '{line}'",
                fields.len()
            )));
        }
        let bad = |what: &str, err: &dyn std::fmt::Display| {
            Error::Config(format!("fstab {what}: {err}"))
        };
        let uuid = Uuid::parse_str(fields[0]).map_err(|e| bad("uuid", &e))?;
        let uid: u32 = fields[3].parse().map_err(|e| bad("uid", &e))?;
        let gid: u32 = fields[4].parse().map_err(|e| bad("gid", &e))?;
        let options = if fields[5] == NO_OPTIONS {
            Vec::new()
        } else {
            fields[5].split(',').map(str::to_string).collect()
        };
        let store: bool = fields[6].parse().map_err(|e| bad("store", &e))?;
        let replicate: bool = fields[7].parse().map_err(|e| bad("replicate", &e))?;
        Ok(MountPoint {
            uuid,
            path: PathBuf::from(fields[1]),
            prefix: fields[2].to_string(),
            uid,
            gid,
            options,
            store,
            replicate,
        })
    }

    fn to_line(&self) -> String {
        let options = if self.options.is_empty() {
            NO_OPTIONS.to_string()
        } else {
            self.options.join(",")
        };
        format!(
            "{} {} {} {} {} {} {} {}",
            self.uuid,
            self.path.display(),
            self.prefix,
            self.uid,
            self.gid,
            options,
            self.store,
            self.replicate
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct Fstab {
    pub mounts: Vec<MountPoint>,
}

impl Fstab {
    /// Loads the table; a missing file is an empty table.
    pub fn load(path: &Path) -> Result<Fstab> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Fstab::default());
            }
            Err(err) => return Err(err.into()),
        };
        let mut mounts = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            mounts.push(MountPoint::parse_line(line)?);
        }
        Ok(Fstab { mounts })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut text = format!("{FSTAB_HEADER} {}\n", Utc::now().to_rfc2822());
        for mount in &self.mounts {
            text.push_str(&mount.to_line());
            text.push('\n');
        }
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn by_prefix(&self, prefix: &str) -> Option<&MountPoint> {
        self.mounts.iter().find(|m| m.prefix == prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MountPoint {
        let mut mount = MountPoint::new(PathBuf::from("/mnt/alpha"), "alpha".into(), 1000, 1000);
        mount.options = vec!["ro".into(), "noatime".into()];
        mount.replicate = false;
        mount
    }

    #[test]
    fn line_round_trip() {
        let mount = sample();
        let parsed = MountPoint::parse_line(&mount.to_line()).unwrap();
        assert_eq!(parsed, mount);
        assert!(parsed.read_only());
    }

    #[test]
    fn empty_options_use_placeholder() {
        let mount = MountPoint::new(PathBuf::from("/mnt/beta"), "beta".into(), 0, 0);
        let line = mount.to_line();
        assert!(line.contains(" defaults "));
        let parsed = MountPoint::parse_line(&line).unwrap();
        assert!(parsed.options.is_empty());
        assert!(!parsed.read_only());
    }

    #[test]
    fn file_round_trip_with_header_and_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fstab");
        let fstab = Fstab {
            mounts: vec![
                sample(),
                MountPoint::new(PathBuf::from("/mnt/beta"), "beta".into(), 0, 0),
            ],
        };
        fstab.save(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with(FSTAB_HEADER));

        let loaded = Fstab::load(&path).unwrap();
        assert_eq!(loaded.mounts, fstab.mounts);
        assert_eq!(loaded.by_prefix("beta").unwrap().uid, 0);
    }

    #[test]
    fn headerless_file_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fstab");
        let mount = sample();
        std::fs::write(&path, format!("{}\n", mount.to_line())).unwrap();
        let loaded = Fstab::load(&path).unwrap();
        assert_eq!(loaded.mounts, vec![mount]);
    }

    #[test]
    fn malformed_line_is_a_config_error() {
        let err = MountPoint::parse_line("not a mount line").unwrap_err();
        assert_eq!(err.kind(), fluid_core::ErrorKind::Config);
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Fstab::load(&dir.path().join("none")).unwrap().mounts.is_empty());
    }
}
