use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::archive::{self, ArchiveReader, ArchiveWriter, ARCHIVE_FORMAT_NAME};
use crate::dist::{self, DistContext};
use crate::download::Downloader;
use crate::error::{Error, Result};
use crate::integrity;
use crate::util;
use crate::PrefixStyle;

pub const RUSTUP_DEFAULT_URL: &str = "https://static.rust-lang.org/rustup";

const RELEASE_STABLE_NAME: &str = "release-stable.toml";

const ARTIFACT_ROOT: &str = "archive";

const VALID_COMMANDS: &[&str] = &[
    "download",
    "verify",
    "list",
    "all-targets",
    "pack",
    "unpack",
    "fixup",
];

// Known targets are found by inspecting the S3 tree, e.g.:
//  aws s3 ls --no-sign-request s3://static-rust-lang-org/rustup/archive/1.26.0/
pub const ALL_KNOWN_TARGETS: &[&str] = &[
    "aarch64-apple-darwin",
    "aarch64-linux-android",
    "aarch64-pc-windows-msvc",
    "aarch64-unknown-linux-gnu",
    "aarch64-unknown-linux-musl",
    "arm-linux-androideabi",
    "arm-unknown-linux-gnueabi",
    "arm-unknown-linux-gnueabihf",
    "armv7-linux-androideabi",
    "armv7-unknown-linux-gnueabihf",
    "i686-apple-darwin",
    "i686-linux-android",
    "i686-pc-windows-gnu",
    "i686-pc-windows-msvc",
    "i686-unknown-linux-gnu",
    "mips-unknown-linux-gnu",
    "mips64-unknown-linux-gnuabi64",
    "mips64el-unknown-linux-gnuabi64",
    "mipsel-unknown-linux-gnu",
    "powerpc-unknown-linux-gnu",
    "powerpc64-unknown-linux-gnu",
    "powerpc64le-unknown-linux-gnu",
    "riscv64gc-unknown-linux-gnu",
    "s390x-unknown-linux-gnu",
    "x86_64-apple-darwin",
    "x86_64-linux-android",
    "x86_64-pc-windows-gnu",
    "x86_64-pc-windows-msvc",
    "x86_64-unknown-freebsd",
    "x86_64-unknown-illumos",
    "x86_64-unknown-linux-gnu",
    "x86_64-unknown-linux-musl",
    "x86_64-unknown-netbsd",
];

/// Rustup SPEC is `X.Y.Z`, `stable`, `latest`, or `*`.
pub fn validate_spec(spec: &str) -> Result<()> {
    if matches!(spec, "*" | "latest" | "stable") || util::is_version(spec) {
        return Ok(());
    }
    Err(Error::usage(format!("invalid SPEC {spec:?}")))
}

#[derive(Deserialize, Serialize)]
struct ReleaseStable {
    #[serde(rename = "schema-version")]
    schema_version: String,
    version: String,
}

pub struct RustupOpts {
    pub specs: Vec<String>,
    pub targets: Vec<String>,
    pub dest: PathBuf,
    pub url: String,
    pub archive: PathBuf,
    pub assume_ok: bool,
    pub keep_going: bool,
}

/// Mirror engine for rustup bootstrap binaries.
pub struct Rustup {
    downloader: Arc<Downloader>,
    ctx: DistContext,
    specs: Vec<String>,
    targets: Vec<String>,
    archive_path: PathBuf,
    assume_ok: bool,
    keep_going: bool,
}

impl Rustup {
    pub fn new(opts: RustupOpts, downloader: Arc<Downloader>) -> Self {
        Self {
            downloader,
            ctx: DistContext::new(opts.dest, opts.url),
            specs: dist::normalize_specs(&opts.specs),
            targets: dist::normalize_targets(&opts.targets),
            archive_path: opts.archive,
            assume_ok: opts.assume_ok,
            keep_going: opts.keep_going,
        }
    }

    pub async fn run(&mut self, commands: &[String]) -> Result<()> {
        dist::verify_commands(commands, VALID_COMMANDS)?;
        for command in commands {
            match command.as_str() {
                "download" => {
                    self.cmd_download().await?;
                    self.cmd_fixup().await?;
                }
                "verify" => self.cmd_verify().await?,
                "list" => self.cmd_list().await?,
                "all-targets" => self.cmd_all_targets()?,
                "pack" => self.cmd_pack().await?,
                "unpack" => {
                    self.cmd_unpack()?;
                    self.cmd_verify().await?;
                    self.cmd_fixup().await?;
                }
                "fixup" => self.cmd_fixup().await?,
                _ => unreachable!("command set verified above"),
            }
        }
        Ok(())
    }

    fn release_stable_path(&self) -> PathBuf {
        self.ctx.dest_path(RELEASE_STABLE_NAME)
    }

    async fn get_release_stable_version(
        &self,
        download: bool,
    ) -> Result<String> {
        let path = self.release_stable_path();
        if download {
            // This file changes upstream without notice; never cache it.
            let url = self.ctx.url(RELEASE_STABLE_NAME)?;
            self.downloader.fetch_cached(&url, &path, false).await?;
        } else if path.is_file() {
            debug!("[read] {}", path.display());
        } else {
            return Err(Error::MissingFile(path));
        }
        let release: ReleaseStable =
            toml::from_str(&fs::read_to_string(&path)?)?;
        Ok(release.version)
    }

    fn artifact_version_rel_path(&self, version: &str) -> String {
        format!("{ARTIFACT_ROOT}/{version}")
    }

    /// `archive/<version>/<target>/rustup-init[.exe]`.
    fn rustup_init_rel_path(&self, version: &str, target: &str) -> String {
        dist::append_exe_suffix(
            &format!(
                "{}/{target}/rustup-init",
                self.artifact_version_rel_path(version)
            ),
            target,
        )
    }

    async fn version_from_spec(
        &self,
        spec: &str,
        download: bool,
    ) -> Result<String> {
        if spec == "stable" {
            self.get_release_stable_version(download).await
        } else {
            Ok(spec.to_owned())
        }
    }

    fn downloaded_versions(&self) -> Vec<String> {
        let versions = util::dir_names(&self.ctx.dest_path(ARTIFACT_ROOT))
            .into_iter()
            .filter(|name| util::is_version(name))
            .collect();
        util::reverse_sorted_versions(versions)
    }

    fn adjust_download_specs(&self) -> Result<Vec<String>> {
        for spec in &self.specs {
            validate_spec(spec)?;
            if spec == "*" || spec == "latest" {
                return Err(Error::usage(format!("invalid wild SPEC: {spec}")));
            }
        }
        dist::require_specs(self.specs.clone())
    }

    fn expand_wild_spec(&self, spec: &str) -> Result<Vec<String>> {
        validate_spec(spec)?;
        let specs = match spec {
            "*" => self.downloaded_versions(),
            "latest" => {
                self.downloaded_versions().into_iter().take(1).collect()
            }
            _ => vec![spec.to_owned()],
        };
        if specs.is_empty() {
            return Err(Error::usage(format!(
                "no matches for wild SPEC {spec:?}"
            )));
        }
        Ok(specs)
    }

    fn adjust_wild_specs(&self) -> Result<Vec<String>> {
        let mut adjusted = Vec::new();
        for spec in &self.specs {
            adjusted.extend(self.expand_wild_spec(spec)?);
        }
        dist::require_specs(adjusted)
    }

    fn downloaded_targets(&self, version: &str) -> Vec<String> {
        util::dir_names(
            &self.ctx.dest_path(&self.artifact_version_rel_path(version)),
        )
    }

    fn adjust_targets(
        &self,
        version: &str,
        base_targets: &[String],
    ) -> Vec<String> {
        let mut targets = BTreeSet::new();
        for target in base_targets {
            if target == "all" {
                targets
                    .extend(ALL_KNOWN_TARGETS.iter().map(|t| t.to_string()));
            } else if target == "*" {
                targets.extend(self.downloaded_targets(version));
            } else {
                if !ALL_KNOWN_TARGETS.contains(&target.as_str()) {
                    warn!("unknown target {target:?}");
                }
                targets.insert(target.clone());
            }
        }
        targets.into_iter().collect()
    }

    async fn download_verify(
        &self,
        download: bool,
        specs: Vec<String>,
        base_targets: Vec<String>,
    ) -> Result<()> {
        let mut num_bad = 0;
        for spec in &specs {
            info!(
                "{}: {spec}",
                if download { "Download" } else { "Verify" }
            );
            let version = self.version_from_spec(spec, download).await?;
            info!("  version: {version}");

            let targets = self.adjust_targets(&version, &base_targets);
            info!("  targets: {}", targets.len());
            for target in &targets {
                trace!("  target: {target}");
            }

            let limiter = self.downloader.limiter();
            let mut tasks = tokio::task::JoinSet::new();
            for target in &targets {
                let rel_path = self.rustup_init_rel_path(&version, target);
                let dest_path = self.ctx.dest_path(&rel_path);
                let url = self.ctx.url(&rel_path)?;
                let permit = limiter
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::abort("download limiter closed"))?;
                let downloader = Arc::clone(&self.downloader);
                let assume_ok = self.assume_ok;
                tasks.spawn(async move {
                    let _permit = permit;
                    if download {
                        downloader
                            .fetch_verify(&url, &dest_path, true, assume_ok, false)
                            .await
                    } else {
                        downloader.verify(&dest_path, false)
                    }
                });
            }
            while let Some(joined) = tasks.join_next().await {
                let result = joined.map_err(|err| {
                    Error::abort(format!("download task failed: {err}"))
                })?;
                if let Err(err) = result {
                    num_bad += 1;
                    error!("{err}");
                }
            }
        }
        if num_bad > 0 {
            error!("{num_bad} bad paths");
            if !self.keep_going {
                return Err(Error::abort(format!("{num_bad} bad paths")));
            }
        }
        Ok(())
    }

    async fn cmd_download(&mut self) -> Result<()> {
        let specs = self.adjust_download_specs()?;
        let base_targets = dist::require_targets(self.targets.clone(), None)?;
        self.download_verify(true, specs, base_targets).await
    }

    async fn cmd_verify(&mut self) -> Result<()> {
        let specs = self.adjust_wild_specs()?;
        let base_targets =
            dist::require_targets(self.targets.clone(), Some("*"))?;
        self.download_verify(false, specs, base_targets).await
    }

    async fn cmd_list(&mut self) -> Result<()> {
        let show_details = tracing::enabled!(tracing::Level::INFO);
        for spec in self.adjust_wild_specs()? {
            debug!("List: {spec}");
            let version = self.version_from_spec(&spec, false).await?;
            if show_details {
                let targets = self.downloaded_targets(&version);
                println!("{version:8} targets[{}]", targets.len());
                for target in targets {
                    println!("  {target}");
                }
            } else {
                println!("{version}");
            }
        }
        Ok(())
    }

    fn cmd_all_targets(&mut self) -> Result<()> {
        info!("All known targets:");
        for target in ALL_KNOWN_TARGETS {
            println!("{target}");
        }
        Ok(())
    }

    fn pack_path(
        &self,
        writer: &mut ArchiveWriter,
        rel_path: &str,
    ) -> Result<usize> {
        let dest_path = self.ctx.dest_path(rel_path);
        debug!("[pack] {rel_path}");
        match writer.append_path(&dest_path, &format!("rustup/{rel_path}")) {
            Ok(()) => Ok(0),
            Err(err @ Error::MissingFile(_)) if self.keep_going => {
                error!("{err}");
                Ok(1)
            }
            Err(err) => Err(err),
        }
    }

    async fn cmd_pack(&mut self) -> Result<()> {
        let base_targets =
            dist::require_targets(self.targets.clone(), Some("*"))?;
        let archive_path = self.archive_path.clone();
        info!("Packing archive: {}", archive_path.display());
        let mut writer =
            ArchiveWriter::create(&archive_path, PrefixStyle::Mixed)?;
        let mut num_bad = 0;
        for spec in self.adjust_wild_specs()? {
            info!("Pack: {spec}");
            let version = self.version_from_spec(&spec, false).await?;
            info!("  version: {version}");

            let targets = self.adjust_targets(&version, &base_targets);
            info!("  targets: {}", targets.len());
            for target in &targets {
                trace!("  target: {target}");
            }

            for target in &targets {
                let rel_path = self.rustup_init_rel_path(&version, target);
                num_bad += self.pack_path(&mut writer, &rel_path)?;
                num_bad += self.pack_path(
                    &mut writer,
                    &integrity::append_hash_suffix(&rel_path),
                )?;
            }
        }
        writer.finish()?;
        if num_bad > 0 {
            error!("{num_bad} bad paths");
        }
        Ok(())
    }

    fn cmd_unpack(&mut self) -> Result<()> {
        let archive_path = self.archive_path.clone();
        info!("Unpacking archive: {}", archive_path.display());
        let member_prefix = format!("rustup/{ARTIFACT_ROOT}/");
        let mut extracted: BTreeSet<String> = BTreeSet::new();
        let mut reader = ArchiveReader::open(&archive_path)?;
        let mut entries = reader.entries()?;
        let mut saw_format = false;
        while let Some(entry) = entries.next() {
            let mut entry = entry?;
            if entry.header().entry_type().is_dir() {
                continue;
            }
            let name = archive::entry_name(&entry)?;
            if !saw_format {
                if name != ARCHIVE_FORMAT_NAME {
                    return Err(Error::UnexpectedArchiveMember(name));
                }
                archive::read_format_entry(&mut entry)?;
                saw_format = true;
                continue;
            }
            let accepted = entry.header().entry_type().is_file()
                && name.starts_with(&member_prefix);
            if !accepted {
                if self.keep_going {
                    warn!("skipping unexpected archive member {name}");
                    continue;
                }
                return Err(Error::UnexpectedArchiveMember(name));
            }
            archive::checked_member_name(&name)?;
            let rel_path = name["rustup/".len()..].to_owned();
            let dest_path = self.ctx.dest_path(&rel_path);
            debug!("[unpack] {rel_path}");
            archive::unpack_entry(&mut entry, &dest_path)?;
            extracted.insert(rel_path);
        }
        if !saw_format {
            return Err(Error::abort("missing ARCHIVE_FORMAT in archive"));
        }

        let (specs, targets) = detect_version_targets(&extracted);
        info!("Unpacked specs: {}", specs.len());
        for spec in &specs {
            info!("  {spec}");
        }
        info!("Unpacked targets: {}", targets.len());
        for target in &targets {
            info!("  {target}");
        }
        self.specs = specs;
        self.targets = targets;
        Ok(())
    }

    fn write_release_stable(&self, version: &str) -> Result<()> {
        let release = ReleaseStable {
            schema_version: "1".to_owned(),
            version: version.to_owned(),
        };
        util::make_dirs_for(&self.release_stable_path())?;
        fs::write(self.release_stable_path(), toml::to_string(&release)?)?;
        Ok(())
    }

    /// Rewrite `release-stable.toml` unless it already names a newer
    /// version.
    async fn fixup_version(&self, version: &str) -> Result<()> {
        let path = self.release_stable_path();
        let write = if path.is_file() {
            let old_version = self.get_release_stable_version(false).await?;
            util::version_sort_key(version)
                >= util::version_sort_key(&old_version)
        } else {
            true
        };
        if write {
            info!("[write] {} (version={version})", path.display());
            self.write_release_stable(version)?;
        }
        Ok(())
    }

    async fn cmd_fixup(&mut self) -> Result<()> {
        for spec in self.adjust_wild_specs()? {
            info!("Fixup: {spec}");
            let version = self.version_from_spec(&spec, false).await?;
            // Artifacts live at <archive>/<version>/<target>/<artifact>;
            // a version with no artifacts for any target is not present.
            let version_path =
                self.ctx.dest_path(&self.artifact_version_rel_path(&version));
            let has_artifacts = util::dir_names(&version_path)
                .iter()
                .any(|target| {
                    fs::read_dir(version_path.join(target))
                        .map(|mut entries| entries.next().is_some())
                        .unwrap_or(false)
                });
            if !has_artifacts {
                return Err(Error::usage(format!(
                    "version {version} not present"
                )));
            }
            self.fixup_version(&version).await?;
        }

        // Mirror rustup/archive/<stable>/ to rustup/dist/.
        let stable_version = self.get_release_stable_version(false).await?;
        let archive_version_path = self
            .ctx
            .dest_path(&self.artifact_version_rel_path(&stable_version));
        if !archive_version_path.is_dir() {
            return Err(Error::MissingDirectory(archive_version_path));
        }
        let dist_path = self.ctx.dest_path("dist");
        if dist_path.is_dir() {
            fs::remove_dir_all(&dist_path)?;
        }
        info!(
            "[copytree] {} -> {}",
            archive_version_path.display(),
            dist_path.display()
        );
        util::copy_tree(&archive_version_path, &dist_path)
    }
}

/// Versions and targets present in extracted
/// `archive/<version>/<target>/<file>` paths.
fn detect_version_targets(
    rel_paths: &BTreeSet<String>,
) -> (Vec<String>, Vec<String>) {
    let mut versions = BTreeSet::new();
    let mut targets = BTreeSet::new();
    for rel_path in rel_paths {
        let parts: Vec<&str> = rel_path.split('/').collect();
        if parts.len() < 4 {
            warn!("unexpected path {rel_path}");
            continue;
        }
        if util::is_version(parts[1]) {
            versions.insert(parts[1].to_owned());
            targets.insert(parts[2].to_owned());
        }
    }
    (
        versions.into_iter().collect(),
        targets.into_iter().collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_validation() {
        for good in ["*", "latest", "stable", "1.26.0"] {
            validate_spec(good).unwrap();
        }
        for bad in ["nightly", "1.26", "stable-2020-01-01", ""] {
            assert!(validate_spec(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn version_target_detection() {
        let rel_paths: BTreeSet<String> = [
            "archive/1.26.0/x86_64-unknown-linux-gnu/rustup-init",
            "archive/1.26.0/x86_64-unknown-linux-gnu/rustup-init.sha256",
            "archive/1.25.2/x86_64-pc-windows-msvc/rustup-init.exe",
            "archive/not-a-version/x/rustup-init",
            "archive/short",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let (versions, targets) = detect_version_targets(&rel_paths);
        assert_eq!(versions, vec!["1.25.2", "1.26.0"]);
        assert_eq!(
            targets,
            vec!["x86_64-pc-windows-msvc", "x86_64-unknown-linux-gnu"]
        );
    }

    #[test]
    fn release_stable_round_trip() {
        let release = ReleaseStable {
            schema_version: "1".to_owned(),
            version: "1.26.0".to_owned(),
        };
        let text = toml::to_string(&release).unwrap();
        assert!(text.contains("schema-version = \"1\""));
        assert!(text.contains("version = \"1.26.0\""));
        let parsed: ReleaseStable = toml::from_str(&text).unwrap();
        assert_eq!(parsed.version, "1.26.0");
    }
}
