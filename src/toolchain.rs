use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, info, trace, warn};

use crate::archive::{self, ArchiveReader, ArchiveWriter, ARCHIVE_FORMAT_NAME};
use crate::dist::{self, DistContext, ProcessedPaths};
use crate::download::Downloader;
use crate::error::{Error, Result};
use crate::integrity;
use crate::manifest::{Manifest, Package, TargetType};
use crate::signature;
use crate::util;
use crate::PrefixStyle;

pub const TOOLCHAIN_DEFAULT_URL: &str = "https://static.rust-lang.org/dist";

const VALID_COMMANDS: &[&str] = &[
    "fetch-manifest",
    "download",
    "verify",
    "list",
    "all-targets",
    "pack",
    "unpack",
    "fixup",
];

fn is_channel(s: &str) -> bool {
    matches!(s, "nightly" | "beta" | "stable" | "*") || util::is_version(s)
}

fn is_date_part(s: &str) -> bool {
    util::is_date(s) || s == "latest" || s == "*"
}

/// Parse a toolchain SPEC into `(date, channel)`.
///
/// Channel forms: `<channel>`, `<channel>-<date>` with channel one of
/// `nightly`, `beta`, `stable`, `X.Y.Z`, or `*`. Date-only forms
/// (`YYYY-MM-DD`, `latest`, `*`) leave the channel as `*`; a lone `*` is a
/// date wildcard, not a channel wildcard.
pub fn parse_spec(spec: &str) -> Result<(String, String)> {
    if spec == "*" {
        return Ok(("*".to_owned(), "*".to_owned()));
    }
    if is_channel(spec) {
        return Ok((String::new(), spec.to_owned()));
    }
    if is_date_part(spec) {
        return Ok((spec.to_owned(), "*".to_owned()));
    }
    for (i, _) in spec.match_indices('-') {
        let (channel, date) = (&spec[..i], &spec[i + 1..]);
        if is_channel(channel) && is_date_part(date) {
            return Ok((date.to_owned(), channel.to_owned()));
        }
    }
    Err(Error::usage(format!("invalid SPEC {spec:?}")))
}

/// Relative path of a channel manifest, optionally below a date directory.
pub fn channel_rel_path(date: &str, channel: &str) -> String {
    let channel_name = format!("channel-rust-{channel}.toml");
    if date.is_empty() {
        channel_name
    } else {
        format!("{date}/{channel_name}")
    }
}

fn detect_specs(rel_paths: &BTreeSet<String>) -> Vec<String> {
    let mut specs = Vec::new();
    for rel_path in rel_paths {
        let Some((date, file)) = rel_path.split_once('/') else {
            continue;
        };
        if !util::is_date(date) {
            continue;
        }
        let Some(channel) = file
            .strip_prefix("channel-rust-")
            .and_then(|f| f.strip_suffix(".toml"))
        else {
            continue;
        };
        if matches!(channel, "nightly" | "beta" | "stable") {
            specs.push(format!("{channel}-{date}"));
        }
    }
    specs
}

pub struct ToolchainOpts {
    pub specs: Vec<String>,
    pub targets: Vec<String>,
    pub dest: PathBuf,
    pub url: String,
    pub archive: PathBuf,
    pub cross: bool,
    pub assume_ok: bool,
    pub keep_going: bool,
    pub no_signature: bool,
}

/// Mirror engine for signed toolchain distributions.
pub struct Toolchain {
    downloader: Arc<Downloader>,
    ctx: DistContext,
    specs: Vec<String>,
    targets: Vec<String>,
    archive_path: PathBuf,
    cross: bool,
    assume_ok: bool,
    keep_going: bool,
    with_sig: bool,
}

impl Toolchain {
    pub fn new(opts: ToolchainOpts, downloader: Arc<Downloader>) -> Self {
        Self {
            downloader,
            ctx: DistContext::new(opts.dest, opts.url),
            specs: dist::normalize_specs(&opts.specs),
            targets: dist::normalize_targets(&opts.targets),
            archive_path: opts.archive,
            cross: opts.cross,
            assume_ok: opts.assume_ok,
            keep_going: opts.keep_going,
            with_sig: !opts.no_signature,
        }
    }

    pub async fn run(&mut self, commands: &[String]) -> Result<()> {
        dist::verify_commands(commands, VALID_COMMANDS)?;
        for command in commands {
            match command.as_str() {
                "fetch-manifest" => self.cmd_fetch_manifest().await?,
                "download" => {
                    self.cmd_download().await?;
                    self.cmd_fixup().await?;
                }
                "verify" => self.cmd_verify().await?,
                "list" => self.cmd_list().await?,
                "all-targets" => self.cmd_all_targets().await?,
                "pack" => self.cmd_pack().await?,
                "unpack" => {
                    self.cmd_unpack().await?;
                    self.cmd_verify().await?;
                    self.cmd_fixup().await?;
                }
                "fixup" => self.cmd_fixup().await?,
                _ => unreachable!("command set verified above"),
            }
        }
        Ok(())
    }

    async fn get_manifest(
        &self,
        date: &str,
        channel: &str,
        download: bool,
    ) -> Result<Manifest> {
        let rel_path = channel_rel_path(date, channel);
        let url = self.ctx.url(&rel_path)?;
        let path = self.ctx.dest_path(&rel_path);
        if download {
            // Undated manifests must observe newer upstream releases, so
            // they are never satisfied from cache.
            let cached = !date.is_empty();
            self.downloader
                .fetch_verify(&url, &path, cached, false, self.with_sig)
                .await?;
        } else {
            self.downloader.verify(&path, self.with_sig)?;
        }
        Manifest::from_toml_path(&path)
    }

    /// Fetch (or verify) the manifest selected by `spec`. With `canonical`,
    /// re-select through the manifest's own date and channel so aliases like
    /// `stable` resolve to their dated form.
    async fn select_manifest(
        &self,
        spec: &str,
        download: bool,
        canonical: bool,
    ) -> Result<Manifest> {
        let (date, channel) = parse_spec(spec)?;
        let manifest = self.get_manifest(&date, &channel, download).await?;
        if canonical
            && (manifest.date() != date || manifest.channel()? != channel)
        {
            let date = manifest.date().to_owned();
            let channel = manifest.channel()?.to_owned();
            return self.get_manifest(&date, &channel, download).await;
        }
        Ok(manifest)
    }

    fn channels_in_dest_date(&self, date: &str) -> Vec<String> {
        let date_path = self.ctx.dest_path(date);
        let prefix = "channel-rust-";
        let suffix = ".toml";
        let mut channels = Vec::new();
        if let Ok(entries) = fs::read_dir(&date_path) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if let Some(channel) = name
                    .strip_prefix(prefix)
                    .and_then(|n| n.strip_suffix(suffix))
                {
                    channels.push(channel.to_owned());
                }
            }
        }
        channels
    }

    /// Downloads require a concrete date and channel.
    fn adjust_download_specs(&self) -> Result<Vec<String>> {
        for spec in &self.specs {
            let (date, channel) = parse_spec(spec)?;
            if date == "*" || channel == "*" || date == "latest" {
                return Err(Error::usage(format!("invalid wild SPEC: {spec}")));
            }
        }
        dist::require_specs(self.specs.clone())
    }

    fn expand_wild_spec(&self, spec: &str) -> Result<Vec<String>> {
        let mut specs = Vec::new();
        let (date, channel) = parse_spec(spec)?;
        if date == "*" || date == "latest" || channel == "*" {
            let channel_patterns: HashSet<String> = if channel == "*" {
                ["nightly", "beta", "stable"]
                    .iter()
                    .map(|c| c.to_string())
                    .collect()
            } else {
                std::iter::once(channel.clone()).collect()
            };
            let dates = if date == "*" || date == "latest" {
                util::reversed_date_dir_names(&self.ctx.dest)
            } else {
                vec![date.clone()]
            };
            for d in dates {
                for c in self.channels_in_dest_date(&d) {
                    if channel_patterns.contains(&c) {
                        specs.push(format!("{c}-{d}"));
                    }
                }
                if date == "latest" && !specs.is_empty() {
                    break;
                }
            }
        } else {
            specs.push(spec.to_owned());
        }
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

    fn adjust_targets(
        &self,
        manifest: &Manifest,
        base_targets: &[String],
    ) -> Result<Vec<String>> {
        let all_targets: HashSet<String> =
            manifest.all_targets().into_iter().collect();
        let mut targets = BTreeSet::new();
        for target in base_targets {
            if target == "all" {
                targets.extend(all_targets.iter().cloned());
            } else if target == "*" {
                let present =
                    |rel: &str| self.ctx.rel_path_is_downloaded(rel);
                targets.extend(
                    manifest
                        .available_target_types(None, Some(&present))?
                        .into_keys(),
                );
            } else if !all_targets.contains(target) {
                return Err(Error::usage(format!(
                    "target {target:?} not found in manifest"
                )));
            } else {
                targets.insert(target.clone());
            }
        }
        Ok(targets.into_iter().collect())
    }

    /// Packages worth syncing for `targets` given what is on disk. For a
    /// cross-target, only the locally present subset matters.
    fn downloaded_target_packages(
        &self,
        manifest: &Manifest,
        targets: &[String],
    ) -> Result<Vec<Package>> {
        let present = |rel: &str| self.ctx.rel_path_is_downloaded(rel);
        let mut packages: BTreeSet<Package> = BTreeSet::new();
        for target in targets {
            let target_slice = [target.clone()];
            let mut target_packages: BTreeSet<Package> = manifest
                .available_packages(Some(&target_slice), None)?
                .into_iter()
                .collect();
            let target_types = manifest
                .available_target_types(Some(&target_slice), Some(&present))?;
            if target_types.get(target) == Some(&TargetType::Cross) {
                let mut kept = BTreeSet::new();
                for package in target_packages {
                    if self.ctx.rel_path_is_downloaded(&package.rel_path()?) {
                        kept.insert(package);
                    }
                }
                target_packages = kept;
            }
            packages.extend(target_packages);
        }
        Ok(packages.into_iter().collect())
    }

    async fn download_verify_packages(
        &self,
        download: bool,
        packages: Vec<Package>,
        processed: &mut ProcessedPaths,
    ) -> Result<(usize, usize)> {
        let limiter = self.downloader.limiter();
        let mut tasks = tokio::task::JoinSet::new();
        for package in packages {
            let rel_path = package.rel_path()?;
            let dest_path = self.ctx.dest_path(&rel_path);
            if !processed.first_visit(&dest_path) {
                debug!("[duplicate] {}", dest_path.display());
                continue;
            }
            let url = self.ctx.url(&rel_path)?;
            let permit = limiter
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| Error::abort("download limiter closed"))?;
            let downloader = Arc::clone(&self.downloader);
            let assume_ok = self.assume_ok;
            let with_sig = self.with_sig;
            tasks.spawn(async move {
                let _permit = permit;
                let result = if download {
                    downloader
                        .fetch_verify(&url, &dest_path, true, assume_ok, with_sig)
                        .await
                } else {
                    downloader.verify(&dest_path, with_sig)
                };
                (dest_path, result)
            });
        }

        let mut num_good = 0;
        let mut num_bad = 0;
        while let Some(joined) = tasks.join_next().await {
            let (_dest_path, result) = joined.map_err(|err| {
                Error::abort(format!("download task failed: {err}"))
            })?;
            match result {
                Ok(()) => num_good += 1,
                Err(err) => {
                    num_bad += 1;
                    error!("{err}");
                }
            }
        }
        Ok((num_good, num_bad))
    }

    async fn download_verify(
        &self,
        download: bool,
        cross: bool,
        specs: Vec<String>,
        base_targets: Vec<String>,
    ) -> Result<()> {
        let mut processed = ProcessedPaths::default();
        let mut num_bad = 0;
        for spec in &specs {
            info!(
                "{}: {spec}",
                if download { "Download" } else { "Verify" }
            );
            let manifest = self.select_manifest(spec, download, true).await?;
            info!("  ident: {}", manifest.ident()?);
            let targets = self.adjust_targets(&manifest, &base_targets)?;
            let packages = if download {
                let mut packages =
                    manifest.available_packages(Some(&targets), None)?;
                if cross {
                    // Cross-compilation needs only the standard library.
                    packages.retain(|p| p.name == "rust-std");
                }
                packages
            } else {
                self.downloaded_target_packages(&manifest, &targets)?
            };
            info!(
                "  packages: {}, targets: {}",
                packages.len(),
                targets.len()
            );
            for target in &targets {
                trace!("  target: {target}");
            }
            let (_good, bad) = self
                .download_verify_packages(download, packages, &mut processed)
                .await?;
            num_bad += bad;
        }
        if num_bad > 0 {
            error!("{num_bad} bad paths");
            if !self.keep_going {
                return Err(Error::abort(format!("{num_bad} bad paths")));
            }
        }
        Ok(())
    }

    async fn cmd_fetch_manifest(&mut self) -> Result<()> {
        for spec in self.adjust_download_specs()? {
            info!("Fetch manifest: {spec}");
            let manifest = self.select_manifest(&spec, true, false).await?;
            info!("  ident: {}", manifest.ident()?);
        }
        Ok(())
    }

    async fn cmd_download(&mut self) -> Result<()> {
        let specs = self.adjust_download_specs()?;
        let base_targets = dist::require_targets(self.targets.clone(), None)?;
        self.download_verify(true, self.cross, specs, base_targets)
            .await
    }

    async fn cmd_verify(&mut self) -> Result<()> {
        let specs = self.adjust_wild_specs()?;
        let base_targets =
            dist::require_targets(self.targets.clone(), Some("*"))?;
        self.download_verify(false, false, specs, base_targets).await
    }

    async fn cmd_list(&mut self) -> Result<()> {
        let show_details = tracing::enabled!(tracing::Level::INFO);
        for spec in self.adjust_wild_specs()? {
            debug!("List: {spec}");
            let manifest = self.select_manifest(&spec, false, false).await?;
            if show_details {
                let available_packages =
                    manifest.available_packages(None, None)?;
                let available_targets =
                    manifest.available_targets(None, None)?;
                let present =
                    |rel: &str| self.ctx.rel_path_is_downloaded(rel);
                let packages =
                    manifest.available_packages(None, Some(&present))?;
                let target_types =
                    manifest.available_target_types(None, Some(&present))?;

                let target_out = format!(
                    "targets[{}/{}]",
                    target_types.len(),
                    available_targets.len()
                );
                let package_out = format!(
                    "packages[{}/{}]",
                    packages.len(),
                    available_packages.len()
                );
                println!(
                    "{:28} {:16} {:18}",
                    manifest.ident()?,
                    target_out,
                    package_out
                );
                let show_minimal =
                    tracing::enabled!(tracing::Level::DEBUG);
                for (target, target_type) in &target_types {
                    if *target_type != TargetType::Minimal || show_minimal {
                        println!("  {target:45} {target_type}");
                    }
                }
            } else {
                println!("{}", manifest.ident()?);
            }
        }
        Ok(())
    }

    async fn cmd_all_targets(&mut self) -> Result<()> {
        for spec in self.adjust_wild_specs()? {
            info!("All targets: {spec}");
            let manifest = self.select_manifest(&spec, false, false).await?;
            info!("  ident: {}", manifest.ident()?);
            for target in manifest.all_targets() {
                println!("{target}");
            }
        }
        Ok(())
    }

    fn pack_path(
        &self,
        writer: &mut ArchiveWriter,
        rel_path: &str,
        processed: &mut ProcessedPaths,
    ) -> Result<usize> {
        let dest_path = self.ctx.dest_path(rel_path);
        if !processed.first_visit(&dest_path) {
            debug!("[duplicate] {rel_path}");
            return Ok(0);
        }
        debug!("[pack] {rel_path}");
        match writer.append_path(&dest_path, &format!("dist/{rel_path}")) {
            Ok(()) => Ok(0),
            Err(err @ Error::MissingFile(_)) if self.keep_going => {
                error!("{err}");
                Ok(1)
            }
            Err(err) => Err(err),
        }
    }

    fn pack_rel_path(
        &self,
        writer: &mut ArchiveWriter,
        rel_path: &str,
        processed: &mut ProcessedPaths,
    ) -> Result<usize> {
        let mut num_bad = self.pack_path(writer, rel_path, processed)?;
        num_bad += self.pack_path(
            writer,
            &integrity::append_hash_suffix(rel_path),
            processed,
        )?;
        if self.with_sig {
            num_bad += self.pack_path(
                writer,
                &signature::append_sig_suffix(rel_path),
                processed,
            )?;
        }
        Ok(num_bad)
    }

    async fn cmd_pack(&mut self) -> Result<()> {
        let base_targets =
            dist::require_targets(self.targets.clone(), Some("*"))?;
        let archive_path = self.archive_path.clone();
        info!("Packing archive: {}", archive_path.display());
        let mut writer =
            ArchiveWriter::create(&archive_path, PrefixStyle::Mixed)?;
        let mut processed = ProcessedPaths::default();
        let mut num_bad = 0;
        for spec in self.adjust_wild_specs()? {
            info!("Pack: {spec}");
            let manifest = self.select_manifest(&spec, false, true).await?;
            info!("  ident: {}", manifest.ident()?);

            let targets = self.adjust_targets(&manifest, &base_targets)?;
            let mut packages =
                self.downloaded_target_packages(&manifest, &targets)?;
            packages.sort_by(|a, b| {
                (&a.target, &a.name).cmp(&(&b.target, &b.name))
            });
            info!(
                "  packages: {}, targets: {}",
                packages.len(),
                targets.len()
            );
            for target in &targets {
                trace!("  target: {target}");
            }

            let channel_rel =
                channel_rel_path(manifest.date(), manifest.channel()?);
            num_bad +=
                self.pack_rel_path(&mut writer, &channel_rel, &mut processed)?;
            for package in &packages {
                num_bad += self.pack_rel_path(
                    &mut writer,
                    &package.rel_path()?,
                    &mut processed,
                )?;
            }
        }
        writer.finish()?;
        if num_bad > 0 {
            error!("{num_bad} bad paths");
        }
        Ok(())
    }

    fn unpack_entry<R: std::io::Read>(
        &self,
        entry: &mut tar::Entry<'_, R>,
        name: &str,
    ) -> Result<String> {
        if !entry.header().entry_type().is_file() {
            return Err(Error::UnexpectedArchiveMember(name.to_owned()));
        }
        let rel_path = name
            .strip_prefix("dist/")
            .ok_or_else(|| {
                Error::UnexpectedArchiveMember(name.to_owned())
            })?
            .to_owned();
        archive::checked_member_name(name)?;
        let dest_path = self.ctx.dest_path(&rel_path);
        debug!("[unpack] {rel_path}");
        archive::unpack_entry(entry, &dest_path)?;
        Ok(rel_path)
    }

    async fn cmd_unpack(&mut self) -> Result<()> {
        let archive_path = self.archive_path.clone();
        info!("Unpacking archive: {}", archive_path.display());
        let mut extracted: BTreeSet<String> = BTreeSet::new();
        {
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
                if name == ARCHIVE_FORMAT_NAME {
                    return Err(Error::abort(
                        "unexpected ARCHIVE_FORMAT (not at archive start)",
                    ));
                }
                match self.unpack_entry(&mut entry, &name) {
                    Ok(rel_path) => {
                        extracted.insert(rel_path);
                    }
                    Err(Error::UnexpectedArchiveMember(member))
                        if self.keep_going =>
                    {
                        warn!("skipping unexpected archive member {member}");
                    }
                    Err(err) => return Err(err),
                }
            }
            if !saw_format {
                return Err(Error::abort("missing ARCHIVE_FORMAT in archive"));
            }
        }

        let specs = detect_specs(&extracted);
        let mut targets = {
            let mut detected = BTreeSet::new();
            for spec in &specs {
                let manifest =
                    self.select_manifest(spec, false, false).await?;
                let present = |rel: &str| extracted.contains(rel);
                detected.extend(
                    manifest
                        .available_target_types(None, Some(&present))?
                        .into_keys(),
                );
            }
            detected.into_iter().collect::<Vec<String>>()
        };

        info!("Unpacked specs: {}", specs.len());
        for spec in &specs {
            info!("  {spec}");
        }
        info!("Unpacked targets: {}", targets.len());
        for target in &targets {
            info!("  {target}");
        }

        // `--target all` produces a per-spec target list; collapse back to
        // `all` when every spec's full target set was unpacked.
        if specs.len() > 1 {
            let detected: HashSet<&String> = targets.iter().collect();
            let mut have_all_targets = true;
            for spec in &specs {
                let manifest =
                    self.select_manifest(spec, false, false).await?;
                let spec_targets =
                    manifest.available_target_types(None, None)?;
                if !spec_targets.keys().all(|t| detected.contains(t)) {
                    have_all_targets = false;
                    break;
                }
            }
            if have_all_targets {
                targets = vec!["all".to_owned()];
            }
        }

        self.specs = specs;
        self.targets = targets;
        Ok(())
    }

    fn write_manifest(
        &self,
        manifest: &Manifest,
        date: &str,
        channel: &str,
    ) -> Result<()> {
        let src_rel =
            channel_rel_path(manifest.date(), manifest.channel()?);
        let dst_rel = channel_rel_path(date, channel);
        let src_path = self.ctx.dest_path(&src_rel);
        let dst_path = self.ctx.dest_path(&dst_rel);
        info!("[publish] {}", dst_path.display());
        util::make_dirs_for(&dst_path)?;
        copy_file(&src_path, &dst_path)?;
        copy_file(
            &integrity::path_append_hash_suffix(&src_path),
            &integrity::path_append_hash_suffix(&dst_path),
        )?;
        if self.with_sig {
            copy_file(
                &signature::path_append_sig_suffix(&src_path),
                &signature::path_append_sig_suffix(&dst_path),
            )?;
        }
        Ok(())
    }

    /// Publish the undated channel alias and, for stable, the
    /// version-numbered aliases. The undated alias is only overwritten by a
    /// manifest at least as new as the one already published.
    async fn write_manifest_variations(
        &self,
        manifest: &Manifest,
    ) -> Result<()> {
        let date = manifest.date().to_owned();
        let channel = manifest.channel()?;

        let top_path = self.ctx.dest_path(&channel_rel_path("", channel));
        let write_top = if top_path.is_file() {
            let top_manifest = self.get_manifest("", channel, false).await?;
            manifest.date() >= top_manifest.date()
        } else {
            true
        };
        if write_top {
            self.write_manifest(manifest, "", channel)?;
        }

        if channel == "stable" {
            let version = manifest.version()?;
            self.write_manifest(manifest, &date, &version)?;
            self.write_manifest(manifest, "", &version)?;
        }
        Ok(())
    }

    async fn cmd_fixup(&mut self) -> Result<()> {
        for spec in self.adjust_wild_specs()? {
            info!("Fixup: {spec}");
            let manifest = self.select_manifest(&spec, false, true).await?;
            debug!("  ident: {}", manifest.ident()?);
            self.write_manifest_variations(&manifest).await?;
        }
        Ok(())
    }
}

fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    fs::copy(src, dst)
        .map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => Error::MissingFile(src.to_owned()),
            _ => Error::Io(err),
        })
        .map(|_| ())
}
