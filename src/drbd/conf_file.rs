// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! conf_file.rs
//!
//! The per resource DRBD configuration file, its temporary twin used for atomic replacement,
//! and the backup copy of the last configuration that was applied successfully.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use log::{error, info, trace, warn};

use super::conf_builder;
use crate::{
    error::{abort_msg, Error, Failure, Result},
    layer::DrbdResource,
};

pub const RES_FILE_SUFFIX: &str = ".res";
pub const RES_TMP_SUFFIX: &str = ".res_tmp";

const IO_CORRECTION: &str = "Check whether enough free space is available, whether the \
                             application has write access to the target directory and whether \
                             the storage is operating flawlessly";

fn io_failure(rsc_name: &str, cause: String, err: io::Error) -> Error {
    Error::storage(
        Failure::new(abort_msg(rsc_name))
            .cause(cause)
            .correction(IO_CORRECTION)
            .with_source(err),
    )
}

#[derive(Debug, Clone)]
pub struct ResFiles {
    pub conf_dir: PathBuf,
    pub backup_dir: PathBuf,
}

impl ResFiles {
    pub fn new(conf_dir: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            conf_dir: conf_dir.into(),
            backup_dir: backup_dir.into(),
        }
    }

    pub fn ensure_dirs(&self) -> io::Result<()> {
        fs::create_dir_all(&self.conf_dir)?;
        fs::create_dir_all(&self.backup_dir)
    }

    pub fn res_file(&self, suffixed_name: &str) -> PathBuf {
        self.conf_dir.join(format!("{suffixed_name}{RES_FILE_SUFFIX}"))
    }

    pub fn tmp_file(&self, suffixed_name: &str) -> PathBuf {
        self.conf_dir.join(format!("{suffixed_name}{RES_TMP_SUFFIX}"))
    }

    pub fn backup_file(&self, suffixed_name: &str) -> PathBuf {
        self.backup_dir
            .join(format!("{suffixed_name}{RES_FILE_SUFFIX}"))
    }

    /// Render the configuration file and replace the one on disk if the content changed. Returns
    /// whether a new file was written.
    pub fn regenerate(&self, rsc: &mut DrbdResource) -> Result<bool> {
        let name = rsc.suffixed_name();
        let res_file = self.res_file(&name);
        let content = conf_builder::render(rsc);

        let mut on_disk = String::new();
        if rsc.res_file_exists {
            match fs::read_to_string(&res_file) {
                Ok(current) => on_disk = current,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!(
                        "Expected resource file {} did not exist. Rewriting...",
                        res_file.display()
                    );
                    rsc.res_file_exists = false;
                }
                Err(e) => error!("could not read {}: {e}", res_file.display()),
            }
        }

        if on_disk == content {
            return Ok(false);
        }

        let tmp_file = self.tmp_file(&name);
        fs::write(&tmp_file, content.as_bytes()).map_err(|e| {
            io_failure(
                &name,
                format!("Creation of the DRBD configuration file for resource '{name}' failed due to an I/O error"),
                e,
            )
        })?;
        // rename replaces the target atomically; readers never see a partial file
        fs::rename(&tmp_file, &res_file).map_err(|e| {
            io_failure(
                &name,
                format!(
                    "Unable to move temporary DRBD resource file '{}' to the resource directory",
                    tmp_file.display()
                ),
                e,
            )
        })?;
        rsc.res_file_exists = true;
        info!("DRBD regenerated resource file: {}", res_file.display());
        Ok(true)
    }

    fn copy(&self, rsc_name: &str, src: &Path, dst: &Path, what: &str) -> Result<()> {
        fs::copy(src, dst)
            .map(|_| ())
            .map_err(|e| io_failure(rsc_name, format!("Failed to {what} of resource '{rsc_name}'"), e))
    }

    pub fn backup(&self, rsc: &DrbdResource) -> Result<()> {
        let name = rsc.suffixed_name();
        self.copy(
            &name,
            &self.res_file(&name),
            &self.backup_file(&name),
            "create a backup of the resource file",
        )
    }

    pub fn restore(&self, rsc: &DrbdResource) -> Result<()> {
        let name = rsc.suffixed_name();
        error!("Restoring resource file from backup: {name}");
        self.copy(
            &name,
            &self.backup_file(&name),
            &self.res_file(&name),
            "restore the resource file from backup",
        )
    }

    /// Remove the configuration file if there is one.
    pub fn delete(&self, rsc: &mut DrbdResource) -> Result<()> {
        let name = rsc.suffixed_name();
        let res_file = self.res_file(&name);
        trace!("Ensuring .res file is deleted: {}", res_file.display());
        remove_if_exists(&res_file).map_err(|e| {
            io_failure(&name, "I/O error while removing the resource file".to_string(), e)
        })?;
        rsc.res_file_exists = false;
        Ok(())
    }

    pub fn delete_backup(&self, rsc: &DrbdResource) -> Result<()> {
        let name = rsc.suffixed_name();
        let backup = self.backup_file(&name);
        trace!("Deleting res file from backup: {}", backup.display());
        remove_if_exists(&backup).map_err(|e| {
            io_failure(
                &name,
                "I/O error while removing the resource file from backup".to_string(),
                e,
            )
        })
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
