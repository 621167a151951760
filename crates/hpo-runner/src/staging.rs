use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::BTreeMap;
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::{info, warn};

use crate::client::ArchiveFetcher;
use crate::config::{InputSpec, Payload};
use crate::error::WorkerError;
use crate::fsutil::remove_file_if_exists;
use crate::packaging::PackagedInputs;

pub const POOL_FILE_CATALOG: &str = "PoolFileCatalog.xml";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("xml error: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("File element without ID attribute")]
    MissingId,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Physical locations of the job's input files, as written by the pilot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolFileCatalog {
    /// Logical file name to physical file name.
    by_lfn: BTreeMap<String, String>,
}

impl PoolFileCatalog {
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let xml = fs::read_to_string(path)?;
        Self::parse(&xml)
    }

    /// Missing or broken catalogs degrade to an empty one.
    pub fn load_or_empty(path: &Path) -> Self {
        match Self::load(path) {
            Ok(catalog) => {
                info!(path = %path.display(), files = catalog.len(), "loaded pool file catalog");
                catalog
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to collect GUIDs");
                Self::default()
            }
        }
    }

    pub fn parse(xml: &str) -> Result<Self, CatalogError> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);
        let mut catalog = Self::default();
        let mut current_guid: Option<String> = None;
        let mut current_pfn: Option<String> = None;
        let mut in_physical = false;

        loop {
            match reader.read_event()? {
                Event::Start(e) => match e.name().as_ref() {
                    b"File" => {
                        current_guid = Some(attribute(&e, b"ID")?.ok_or(CatalogError::MissingId)?);
                        current_pfn = None;
                    }
                    b"physical" => in_physical = true,
                    b"pfn" if in_physical => record_pfn(&e, &mut current_pfn)?,
                    _ => {}
                },
                Event::Empty(e) => {
                    if e.name().as_ref() == b"pfn" && in_physical {
                        record_pfn(&e, &mut current_pfn)?;
                    }
                }
                Event::End(e) => match e.name().as_ref() {
                    b"physical" => in_physical = false,
                    b"File" => {
                        if let (Some(_), Some(pfn)) = (current_guid.take(), current_pfn.take()) {
                            catalog.insert(pfn);
                        }
                    }
                    _ => {}
                },
                Event::Eof => break,
                _ => {}
            }
        }
        Ok(catalog)
    }

    fn insert(&mut self, pfn: String) {
        let lfn = pfn.rsplit('/').next().unwrap_or(&pfn).to_string();
        self.by_lfn.insert(lfn, pfn);
    }

    pub fn pfn_for_lfn(&self, lfn: &str) -> Option<&str> {
        self.by_lfn.get(lfn).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_lfn.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_lfn.is_empty()
    }
}

fn record_pfn(e: &BytesStart<'_>, slot: &mut Option<String>) -> Result<(), CatalogError> {
    if slot.is_none() {
        *slot = attribute(e, b"name")?;
    }
    Ok(())
}

fn attribute(e: &BytesStart<'_>, name: &[u8]) -> Result<Option<String>, CatalogError> {
    for attr in e.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        if attr.key.as_ref() == name {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

/// Input list with every stream member appended if it was missing.
pub fn merged_input_files(spec: &InputSpec) -> Vec<String> {
    let mut files = spec.files.clone();
    for stream_files in spec.streams.values() {
        for file in stream_files {
            if !files.contains(file) {
                files.push(file.clone());
            }
        }
    }
    files
}

/// Makes the inputs reachable from `run_dir`: symlinks to files shipped in
/// `entry_dir`, or catalog PFNs when reading directly.
pub fn stage_inputs(
    spec: &InputSpec,
    catalog: &PoolFileCatalog,
    entry_dir: &Path,
    run_dir: &Path,
) -> Result<PackagedInputs, WorkerError> {
    let requested = merged_input_files(spec);
    if requested.is_empty() {
        return Ok(PackagedInputs::default());
    }

    let mut resolved: BTreeMap<String, String> = BTreeMap::new();
    let mut all = Vec::new();
    for file in &requested {
        let staged = if spec.direct_access {
            catalog.pfn_for_lfn(file).map(str::to_string)
        } else if entry_dir.join(file).is_file() {
            link_input(&entry_dir.join(file), &run_dir.join(file))?;
            Some(file.clone())
        } else {
            None
        };
        match staged {
            Some(name) => {
                resolved.insert(file.clone(), name.clone());
                all.push(name);
            }
            None => warn!(file = %file, "input file does not exist"),
        }
    }
    if all.is_empty() {
        return Err(WorkerError::NoInput);
    }
    info!(inputs = ?all, "staged input files");

    let streams = spec
        .streams
        .iter()
        .map(|(token, files)| {
            let staged = files
                .iter()
                .filter_map(|f| resolved.get(f).cloned())
                .collect();
            (token.clone(), staged)
        })
        .collect();
    Ok(PackagedInputs { all, streams })
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Links `target` into place at `link`. A link that already resolves to
/// the target, or is the target, is left alone.
fn link_input(target: &Path, link: &Path) -> std::io::Result<()> {
    if same_file(target, link) {
        return Ok(());
    }
    remove_file_if_exists(link)?;
    place_link(target, link)
}

#[cfg(unix)]
fn place_link(target: &Path, link: &Path) -> std::io::Result<()> {
    symlink(target, link)
}

#[cfg(not(unix))]
fn place_link(target: &Path, link: &Path) -> std::io::Result<()> {
    fs::copy(target, link).map(|_| ())
}

/// Extracts a gzipped tarball into `dest`.
pub fn expand_tarball(archive: &Path, dest: &Path) -> Result<(), WorkerError> {
    let output = Command::new("tar")
        .arg("xvfzm")
        .arg(archive)
        .current_dir(dest)
        .output();
    match output {
        Ok(output) if output.status.success() => {
            info!(
                archive = %archive.display(),
                listing = %String::from_utf8_lossy(&output.stdout).trim_end(),
                "expanded archive"
            );
            Ok(())
        }
        Ok(output) => {
            warn!(
                archive = %archive.display(),
                stderr = %String::from_utf8_lossy(&output.stderr).trim_end(),
                "tar failed"
            );
            Err(WorkerError::CorruptedArchive {
                path: archive.to_path_buf(),
            })
        }
        Err(e) => {
            warn!(archive = %archive.display(), error = %e, "failed to run tar");
            Err(WorkerError::CorruptedArchive {
                path: archive.to_path_buf(),
            })
        }
    }
}

/// Unpacks the user libraries, or downloads and unpacks the job-option
/// archive when no libraries were given.
pub fn prepare_payload_archives(
    payload: &Payload,
    entry_dir: &Path,
    work_dir: &Path,
    source_url: &str,
    fetcher: &dyn ArchiveFetcher,
) -> Result<(), WorkerError> {
    if let Some(libraries) = payload.libraries.as_deref().filter(|s| !s.is_empty()) {
        let path = if Path::new(libraries).is_absolute() {
            PathBuf::from(libraries)
        } else {
            entry_dir.join(libraries)
        };
        return expand_tarball(&path, work_dir);
    }
    if let Some(archive) = payload.archive.as_deref().filter(|s| !s.is_empty()) {
        let url = format!("{}/cache/{}", source_url.trim_end_matches('/'), archive);
        let file_name = archive.rsplit('/').next().unwrap_or(archive);
        let dest = work_dir.join(file_name);
        fetcher
            .fetch(&url, &dest)
            .map_err(|source| WorkerError::Download {
                url: url.clone(),
                source,
            })?;
        info!(url = %url, dest = %dest.display(), "downloaded archive");
        return expand_tarball(&dest, work_dir);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use crate::fsutil::scratch_dir;
    use std::cell::RefCell;

    const CATALOG: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="no" ?>
<!-- Edited By POOL -->
<!DOCTYPE POOLFILECATALOG SYSTEM "InMemory">
<POOLFILECATALOG>
  <File ID="A1B2">
    <physical>
      <pfn filetype="ROOT_All" name="root://eos.example//data/user.train.001.h5"/>
    </physical>
    <logical/>
  </File>
  <File ID="C3D4">
    <physical>
      <pfn filetype="ROOT_All" name="/scratch/pilot/user.test.002.h5"></pfn>
    </physical>
  </File>
</POOLFILECATALOG>
"#;

    #[test]
    fn catalog_maps_lfn_to_pfn() {
        let catalog = PoolFileCatalog::parse(CATALOG).expect("parse");
        assert_eq!(catalog.len(), 2);
        assert_eq!(
            catalog.pfn_for_lfn("user.train.001.h5"),
            Some("root://eos.example//data/user.train.001.h5")
        );
        assert_eq!(
            catalog.pfn_for_lfn("user.test.002.h5"),
            Some("/scratch/pilot/user.test.002.h5")
        );
        assert_eq!(catalog.pfn_for_lfn("missing.h5"), None);
    }

    #[test]
    fn missing_catalog_degrades_to_empty() {
        let root = scratch_dir("pfc_missing");
        let catalog = PoolFileCatalog::load_or_empty(&root.join(POOL_FILE_CATALOG));
        assert!(catalog.is_empty());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn file_without_id_is_an_error() {
        let xml = r#"<POOLFILECATALOG><File><physical><pfn name="/x"/></physical></File></POOLFILECATALOG>"#;
        assert!(matches!(
            PoolFileCatalog::parse(xml),
            Err(CatalogError::MissingId)
        ));
    }

    #[test]
    fn stream_files_are_merged_into_inputs() {
        let spec = InputSpec {
            files: vec!["a".into()],
            streams: BTreeMap::from([
                ("IN".to_string(), vec!["a".to_string()]),
                ("BKG".to_string(), vec!["b".to_string(), "c".to_string()]),
            ]),
            ..Default::default()
        };
        assert_eq!(merged_input_files(&spec), vec!["a", "b", "c"]);
    }

    #[cfg(unix)]
    #[test]
    fn local_inputs_are_symlinked_and_missing_ones_skipped() {
        let root = scratch_dir("stage_local");
        let entry = root.join("entry");
        let run = root.join("entry").join("workDir");
        fs::create_dir_all(&run).expect("dirs");
        fs::write(entry.join("a.h5"), "a").expect("a");
        fs::write(entry.join("b.h5"), "b").expect("b");
        let spec = InputSpec {
            files: vec!["a.h5".into(), "gone.h5".into()],
            streams: BTreeMap::from([
                ("IN".to_string(), vec!["a.h5".to_string(), "gone.h5".to_string()]),
                ("BKG".to_string(), vec!["b.h5".to_string()]),
            ]),
            ..Default::default()
        };

        let staged =
            stage_inputs(&spec, &PoolFileCatalog::default(), &entry, &run).expect("stage");

        assert_eq!(staged.all, vec!["a.h5", "b.h5"]);
        assert_eq!(staged.streams["IN"], vec!["a.h5"]);
        assert_eq!(staged.streams["BKG"], vec!["b.h5"]);
        let link = fs::read_link(run.join("a.h5")).expect("symlink");
        assert_eq!(link, entry.join("a.h5"));
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn staging_into_the_entry_dir_keeps_the_input() {
        let root = scratch_dir("stage_same_dir");
        fs::write(root.join("a.h5"), "precious").expect("a");
        let spec = InputSpec {
            files: vec!["a.h5".into()],
            ..Default::default()
        };

        let staged =
            stage_inputs(&spec, &PoolFileCatalog::default(), &root, &root).expect("stage");

        assert_eq!(staged.all, vec!["a.h5"]);
        assert!(!fs::symlink_metadata(root.join("a.h5"))
            .expect("meta")
            .file_type()
            .is_symlink());
        assert_eq!(
            fs::read_to_string(root.join("a.h5")).expect("still readable"),
            "precious"
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn direct_access_uses_catalog_pfns() {
        let root = scratch_dir("stage_direct");
        let spec = InputSpec {
            files: vec!["user.train.001.h5".into()],
            direct_access: true,
            ..Default::default()
        };
        let catalog = PoolFileCatalog::parse(CATALOG).expect("parse");
        let staged = stage_inputs(&spec, &catalog, &root, &root).expect("stage");
        assert_eq!(
            staged.all,
            vec!["root://eos.example//data/user.train.001.h5"]
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn nothing_resolvable_is_no_input() {
        let root = scratch_dir("stage_none");
        let spec = InputSpec {
            files: vec!["nope.h5".into()],
            ..Default::default()
        };
        let err = stage_inputs(&spec, &PoolFileCatalog::default(), &root, &root)
            .expect_err("no input");
        assert_eq!(err.exit_code(), crate::error::EC_NO_INPUT);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn no_requested_inputs_is_fine() {
        let root = scratch_dir("stage_empty");
        let staged = stage_inputs(
            &InputSpec::default(),
            &PoolFileCatalog::default(),
            &root,
            &root,
        )
        .expect("stage");
        assert!(staged.is_empty());
        let _ = fs::remove_dir_all(root);
    }

    fn make_tarball(dir: &Path, name: &str) -> PathBuf {
        let src = dir.join("src");
        fs::create_dir_all(&src).expect("src");
        fs::write(src.join("train.py"), "print('hi')\n").expect("file");
        let tarball = dir.join(name);
        let status = Command::new("tar")
            .arg("czf")
            .arg(&tarball)
            .arg("-C")
            .arg(&src)
            .arg("train.py")
            .status()
            .expect("tar available");
        assert!(status.success());
        tarball
    }

    #[test]
    fn relative_libraries_expand_from_entry_dir() {
        let root = scratch_dir("libs");
        let work = root.join("workDir");
        fs::create_dir_all(&work).expect("work");
        make_tarball(&root, "libs.tgz");
        let payload = Payload {
            libraries: Some("libs.tgz".into()),
            ..Default::default()
        };
        prepare_payload_archives(&payload, &root, &work, "https://unused", &NoFetch)
            .expect("expand");
        assert!(work.join("train.py").is_file());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn corrupted_tarball_is_reported() {
        let root = scratch_dir("corrupt");
        fs::write(root.join("bad.tgz"), "not a tarball").expect("write");
        let err = expand_tarball(&root.join("bad.tgz"), &root).expect_err("corrupt");
        assert_eq!(err.exit_code(), crate::error::EC_TARBALL);
        let _ = fs::remove_dir_all(root);
    }

    struct NoFetch;

    impl ArchiveFetcher for NoFetch {
        fn fetch(&self, url: &str, _dest: &Path) -> Result<(), RemoteError> {
            Err(RemoteError::NotFound(url.to_string()))
        }
    }

    struct CopyFetch {
        source: PathBuf,
        urls: RefCell<Vec<String>>,
    }

    impl ArchiveFetcher for CopyFetch {
        fn fetch(&self, url: &str, dest: &Path) -> Result<(), RemoteError> {
            self.urls.borrow_mut().push(url.to_string());
            fs::copy(&self.source, dest)?;
            Ok(())
        }
    }

    #[test]
    fn archive_is_downloaded_from_cache_then_expanded() {
        let root = scratch_dir("archive");
        let work = root.join("workDir");
        fs::create_dir_all(&work).expect("work");
        let fetcher = CopyFetch {
            source: make_tarball(&root, "jobO.tgz"),
            urls: RefCell::new(Vec::new()),
        };
        let payload = Payload {
            archive: Some("jobO.abc.tgz".into()),
            ..Default::default()
        };
        prepare_payload_archives(&payload, &root, &work, "https://cache.example/", &fetcher)
            .expect("prepare");
        assert_eq!(
            *fetcher.urls.borrow(),
            vec!["https://cache.example/cache/jobO.abc.tgz".to_string()]
        );
        assert!(work.join("train.py").is_file());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn failed_download_maps_to_wget_code() {
        let root = scratch_dir("archive_fail");
        let payload = Payload {
            archive: Some("jobO.tgz".into()),
            ..Default::default()
        };
        let err = prepare_payload_archives(&payload, &root, &root, "https://x", &NoFetch)
            .expect_err("download fails");
        assert_eq!(err.exit_code(), crate::error::EC_WGET);
        let _ = fs::remove_dir_all(root);
    }
}
