//! `-o` option handling and cache-root resolution.
//!
//! The command line follows the mount(8) convention:
//! `cachefs MOUNTPOINT -o target=PATH[,cache=PATH][,allow_other][,...]`.

use std::io;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use fuser::MountOption;

/// Options parsed out of the `-o` lists.
#[derive(Debug, Default, Eq, PartialEq)]
pub struct Options {
    /// The directory whose contents get mirrored and cached. Required.
    pub target: Option<PathBuf>,
    /// Where the metadata store and shadow files live. Derived from the
    /// target when absent.
    pub cache: Option<PathBuf>,
    /// Remaining options, forwarded to the FUSE mount.
    pub fuse_options: Vec<MountOption>,
}

/// Parse comma-separated `-o` values, accumulating across repeats.
pub fn parse_options<'a>(lists: impl Iterator<Item = &'a str>) -> io::Result<Options> {
    let mut options = Options::default();
    for list in lists {
        for opt in list.split(',').filter(|o| !o.is_empty()) {
            match opt.split_once('=') {
                Some(("target", path)) => options.target = Some(PathBuf::from(path)),
                Some(("cache", path)) => options.cache = Some(PathBuf::from(path)),
                Some(("fsname", name)) => options
                    .fuse_options
                    .push(MountOption::FSName(name.to_string())),
                None if opt == "allow_other" => {
                    options.fuse_options.push(MountOption::AllowOther)
                }
                None if opt == "allow_root" => options.fuse_options.push(MountOption::AllowRoot),
                None if opt == "auto_unmount" => {
                    options.fuse_options.push(MountOption::AutoUnmount)
                }
                None if opt == "default_permissions" => options
                    .fuse_options
                    .push(MountOption::DefaultPermissions),
                None if opt == "ro" => options.fuse_options.push(MountOption::RO),
                None if opt == "rw" => options.fuse_options.push(MountOption::RW),
                _ => {
                    return Err(io::Error::new(
                        ErrorKind::InvalidInput,
                        format!("unknown mount option: {opt}"),
                    ))
                }
            }
        }
    }
    Ok(options)
}

/// The default cache root for a target: a directory named by a stable hash
/// of the absolute target path, under `~/.cachefs`.
pub fn default_cache_root(home: &Path, target_abs: &Path) -> PathBuf {
    use std::os::unix::ffi::OsStrExt;
    let digest = md5::compute(target_abs.as_os_str().as_bytes());
    home.join(".cachefs").join(format!("{digest:x}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_target_and_cache() {
        let opts = parse_options(["target=/src,cache=/var/cache"].into_iter()).unwrap();
        assert_eq!(opts.target, Some(PathBuf::from("/src")));
        assert_eq!(opts.cache, Some(PathBuf::from("/var/cache")));
        assert!(opts.fuse_options.is_empty());
    }

    #[test]
    fn accumulates_repeated_lists() {
        let opts = parse_options(["target=/src", "auto_unmount,allow_other"].into_iter()).unwrap();
        assert_eq!(opts.target, Some(PathBuf::from("/src")));
        assert_eq!(
            opts.fuse_options,
            vec![MountOption::AutoUnmount, MountOption::AllowOther]
        );
    }

    #[test]
    fn rejects_unknown_options() {
        assert!(parse_options(["target=/src,frobnicate"].into_iter()).is_err());
    }

    #[test]
    fn cache_root_is_stable_and_distinct() {
        let home = Path::new("/home/u");
        let a = default_cache_root(home, Path::new("/data/a"));
        assert_eq!(a, default_cache_root(home, Path::new("/data/a")));
        assert_ne!(a, default_cache_root(home, Path::new("/data/b")));
        assert!(a.starts_with("/home/u/.cachefs"));
    }
}
