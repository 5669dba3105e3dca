use crate::{
    config::{ConfigErrors, SharedDataConfig},
    task::{StagingAction, StagingDirective, STAGING_PREFIX},
};
use globset::{Glob, GlobMatcher};
use ignore::{DirEntry, WalkBuilder};
use itertools::Itertools;
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq)]
/// Files staged once into the allocation before the first unit runs. Read only afterwards.
pub struct SharedData {
    files: Vec<PathBuf>,
}

impl SharedData {
    #[cfg(test)]
    pub fn new(files: Vec<PathBuf>) -> Self {
        Self { files }
    }

    /// walk all configured paths and keep the files matching the entry's glob
    pub fn collect(configs: &[SharedDataConfig]) -> Result<Self, ConfigErrors> {
        let mut files = Vec::new();

        for config in configs {
            let matcher: Option<GlobMatcher> = match config.glob {
                Some(ref glob) => Some(Glob::new(glob)?.compile_matcher()),
                None => None,
            };
            let mut paths = config.paths.iter().chain(config.path.iter());
            let Some(first) = paths.next() else {
                continue;
            };
            let mut builder = WalkBuilder::new(first);

            debug!("Filtering shared data with glob: {matcher:?}");
            // add other paths
            paths.for_each(|path| {
                builder.add(path);
            });

            files.extend(
                builder
                    .standard_filters(false)
                    .build()
                    .filter_map(|entry| match entry {
                        Ok(entry) => Some(entry),
                        Err(e) => {
                            warn!("Failed to search for shared data: {e}");
                            None
                        }
                    })
                    .filter(|entry| entry.file_type().map_or(false, |kind| kind.is_file()))
                    .map(DirEntry::into_path)
                    .filter(|path| {
                        matcher.as_ref().map_or(true, |matcher| {
                            path.file_name()
                                .map_or(false, |name| matcher.is_match(name))
                        })
                    }),
            );
        }

        let files = files.into_iter().unique().collect_vec();
        debug!("Collected {} shared files", files.len());

        // the staging area and the sandboxes are flat, a name can only be taken once
        let mut staged: BTreeMap<String, &PathBuf> = BTreeMap::new();
        for path in files.iter() {
            let name = Self::name(path);
            if let Some(first) = staged.insert(name.clone(), path) {
                return Err(ConfigErrors::DuplicateSharedData {
                    name,
                    first: first.clone(),
                    second: path.clone(),
                });
            }
        }

        Ok(Self { files })
    }

    #[cfg(test)]
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    fn name(path: &Path) -> String {
        path.file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned())
    }

    /// directives moving every shared file into the staging area of the allocation
    pub fn allocation_directives(&self) -> Vec<StagingDirective> {
        self.files
            .iter()
            .map(|path| {
                StagingDirective::new(
                    path.to_string_lossy(),
                    format!("{STAGING_PREFIX}{}", Self::name(path)),
                    StagingAction::Transfer,
                )
            })
            .collect()
    }

    /// directives every unit carries to get a copy of the shared files
    pub fn unit_directives(&self) -> Vec<StagingDirective> {
        self.files
            .iter()
            .map(|path| StagingDirective::from_staging_area(&Self::name(path)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn collect_with_glob() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("ala10.prmtop"), "").unwrap();
        fs::write(dir.path().join("nested").join("ala20.prmtop"), "").unwrap();
        fs::write(dir.path().join("notes.txt"), "").unwrap();

        let shared = SharedData::collect(&[SharedDataConfig {
            path: None,
            paths: vec![dir.path().to_string_lossy().into_owned()],
            glob: Some("*.prmtop".to_owned()),
        }])
        .unwrap();

        let mut names = shared
            .files()
            .iter()
            .map(|path| path.file_name().unwrap().to_string_lossy().into_owned())
            .collect_vec();
        names.sort();
        assert_eq!(names, vec!["ala10.prmtop", "ala20.prmtop"]);
    }

    #[test]
    fn collect_without_glob_takes_everything() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.in"), "").unwrap();
        fs::write(dir.path().join("b.in"), "").unwrap();

        let shared = SharedData::collect(&[SharedDataConfig {
            path: Some(dir.path().to_string_lossy().into_owned()),
            paths: Vec::new(),
            glob: None,
        }])
        .unwrap();

        assert_eq!(shared.files().len(), 2);
    }

    #[test]
    fn same_name_in_two_directories() {
        let dir = tempdir().unwrap();
        for system in ["a", "b"] {
            fs::create_dir(dir.path().join(system)).unwrap();
            fs::write(dir.path().join(system).join("ala.prmtop"), system).unwrap();
        }

        let result = SharedData::collect(&[SharedDataConfig {
            path: Some(dir.path().to_string_lossy().into_owned()),
            paths: Vec::new(),
            glob: Some("*.prmtop".to_owned()),
        }]);

        match result {
            Err(ConfigErrors::DuplicateSharedData { name, first, second }) => {
                assert_eq!(name, "ala.prmtop");
                assert_ne!(first, second);
            }
            other => panic!("expected a duplicate name, got {other:?}"),
        }
    }

    #[test]
    fn same_file_listed_twice() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("ala.prmtop"), "").unwrap();
        let root = dir.path().to_string_lossy().into_owned();

        let shared = SharedData::collect(&[SharedDataConfig {
            path: Some(root.clone()),
            paths: vec![root],
            glob: None,
        }])
        .unwrap();

        assert_eq!(shared.allocation_directives().len(), 1);
    }

    #[test]
    fn invalid_glob() {
        assert!(matches!(
            SharedData::collect(&[SharedDataConfig {
                path: Some(".".to_owned()),
                paths: Vec::new(),
                glob: Some("[".to_owned()),
            }]),
            Err(ConfigErrors::InvalidGlobs(_))
        ));
    }

    #[test]
    fn directives() {
        let shared = SharedData::new(vec![PathBuf::from("/data/inputs/ala10.prmtop")]);

        assert_eq!(
            shared.allocation_directives(),
            vec![StagingDirective::new(
                "/data/inputs/ala10.prmtop",
                "staging:///ala10.prmtop",
                StagingAction::Transfer
            )]
        );
        assert_eq!(
            shared.unit_directives(),
            vec![StagingDirective::from_staging_area("ala10.prmtop")]
        );
    }
}
