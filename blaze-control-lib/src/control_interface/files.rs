//! The HTTP side channel: the device filesystem, backups and reboots.

use std::fs;
use std::path::Path;

use anyhow::{anyhow, bail, Context};
use bytes::Bytes;
use log::{debug, info};
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;

use crate::codec::container::filter_file_names;
use crate::codec::{Backup, BinaryPattern, FileTypes};
use crate::control_interface::ControlInterface;

/// Files that may exist on any device, listed when `/list` is unavailable.
const WELL_KNOWN_FILES: [&str; 7] = [
    "/apple-touch-icon.png",
    "/favicon.ico",
    "/config.json",
    "/obconf.dat",
    "/pixelmap.txt",
    "/pixelmap.dat",
    "/l/_defaultplaylist_",
];

/// Parses the `/list` body: one `name<TAB>size` per line.
pub fn parse_file_list(body: &str) -> Vec<String> {
    body.split('\n')
        .filter_map(|line| line.split('\t').next())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

impl ControlInterface {
    /// Sorted names of the device files whose category is in `types`.
    pub async fn get_file_list(&self, types: FileTypes) -> anyhow::Result<Vec<String>> {
        let url = self.get_url("list");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to list files")?;

        let names = match response.status() {
            StatusCode::OK => parse_file_list(&response.text().await?),
            StatusCode::NOT_FOUND => {
                debug!("{} has no /list endpoint, deriving names from patterns", self.host);
                let mut names: Vec<String> = Vec::new();
                for id in self.get_pattern_list(false).await?.into_keys() {
                    names.push(format!("/p/{}", id));
                    names.push(format!("/p/{}.c", id));
                }
                names.extend(WELL_KNOWN_FILES.iter().map(|name| name.to_string()));
                names
            }
            status => bail!("Failed to list files with status: {}", status),
        };
        Ok(filter_file_names(names, types))
    }

    /// Downloads a file; `None` if it does not exist.
    pub async fn get_file(&self, name: &str) -> anyhow::Result<Option<Bytes>> {
        let url = self.get_url(name);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to get {}", name))?;

        match response.status() {
            StatusCode::OK => Ok(Some(response.bytes().await?)),
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(anyhow!("Failed to get {} with status: {}", name, status)),
        }
    }

    pub async fn put_file(&self, name: &str, contents: Bytes) -> anyhow::Result<()> {
        let url = self.get_url("edit");
        let part = Part::bytes(contents.to_vec()).file_name(name.to_string());
        let form = Form::new().part("data", part);
        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("Failed to put {}", name))?;

        if response.status() == StatusCode::OK {
            Ok(())
        } else {
            Err(anyhow!(
                "Failed to put {} with status: {}",
                name,
                response.status()
            ))
        }
    }

    /// Deletes a file. Deleting a missing file is not an error.
    pub async fn delete_file(&self, name: &str) -> anyhow::Result<()> {
        let url = self.get_url("delete");
        let response = self
            .client
            .get(&url)
            .query(&[("path", name)])
            .send()
            .await
            .with_context(|| format!("Failed to delete {}", name))?;

        match response.status() {
            StatusCode::OK | StatusCode::NOT_FOUND => Ok(()),
            status => Err(anyhow!("Failed to delete {} with status: {}", name, status)),
        }
    }

    pub async fn reboot(&self) -> anyhow::Result<()> {
        let url = self.get_url("reboot");
        let response = self
            .client
            .post(&url)
            .send()
            .await
            .context("Failed to reboot")?;

        match response.status() {
            StatusCode::OK | StatusCode::NOT_FOUND => {
                info!("rebooting {}", self.host);
                Ok(())
            }
            status => Err(anyhow!("Failed to reboot with status: {}", status)),
        }
    }

    /// Downloads a stored pattern with its preview, bytecode and source.
    pub async fn get_pattern(&self, id: &str) -> anyhow::Result<BinaryPattern> {
        let Some(data) = self.get_file(&format!("/p/{}", id)).await? else {
            bail!("Pattern {} does not exist", id);
        };
        BinaryPattern::from_bytes(id, &data).with_context(|| format!("Failed to decode pattern {}", id))
    }

    /// Collects every file except the web application into a backup.
    pub async fn save_backup(&self) -> anyhow::Result<Backup> {
        let mut backup = Backup::new(&self.get_device_name().await?);
        for name in self.get_file_list(FileTypes::user_files()).await? {
            debug!("downloading {}", name);
            match self.get_file(&name).await? {
                Some(contents) => backup.put_file(&name, contents),
                None => debug!("{} vanished before it could be downloaded", name),
            }
        }
        info!("backed up {} files from {}", backup.len(), self.host);
        Ok(backup)
    }

    /// Replaces the device files with those in `backup` and reboots.
    pub async fn restore_backup(&self, backup: &Backup) -> anyhow::Result<()> {
        for name in self.get_file_list(FileTypes::user_files()).await? {
            debug!("deleting {}", name);
            self.delete_file(&name).await?;
        }
        for name in backup.file_list(FileTypes::all()) {
            if let Some(contents) = backup.get_file(&name) {
                debug!("uploading {}", name);
                self.put_file(&name, contents.clone()).await?;
            }
        }
        info!("restored {} files to {}", backup.len(), self.host);
        self.reboot().await
    }
}

impl Backup {
    /// Loads a backup; the device name is taken from the file stem.
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Backup> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read backup {}", path.display()))?;
        let device_name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Backup::parse(&device_name, &text)?)
    }

    /// Writes the backup with a `.pbb` extension.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref().with_extension("pbb");
        fs::write(&path, self.to_json()?)
            .with_context(|| format!("Failed to write backup {}", path.display()))
    }
}

impl BinaryPattern {
    /// Loads a pattern; the id is taken from the file stem.
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<BinaryPattern> {
        let path = path.as_ref();
        let data = fs::read(path)
            .with_context(|| format!("Failed to read pattern {}", path.display()))?;
        let id = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(BinaryPattern::from_bytes(&id, &data)?)
    }

    /// Writes the pattern with a `.pbp` extension.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref().with_extension("pbp");
        fs::write(&path, self.to_bytes())
            .with_context(|| format!("Failed to write pattern {}", path.display()))
    }
}
