use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{crate_version, Arg, ArgAction, Command};
use fuser::MountOption;
use log::debug;

use cachefs::mount_options::{default_cache_root, parse_options};
use cachefs::{CacheFs, MetaStore};

fn run() -> anyhow::Result<()> {
    let matches = Command::new("cachefs")
        .version(crate_version!())
        .about("Mount a directory with transparent on-disk read caching")
        .arg(
            Arg::new("MOUNT_POINT")
                .required(true)
                .index(1)
                .help("Where to mount the cached view of the target"),
        )
        .arg(
            Arg::new("options")
                .short('o')
                .value_name("OPT[,OPT...]")
                .action(ArgAction::Append)
                .help("Mount options: target=PATH (required), cache=PATH, allow_other, allow_root, auto_unmount, default_permissions, ro, rw"),
        )
        .get_matches();

    let mountpoint = PathBuf::from(matches.get_one::<String>("MOUNT_POINT").unwrap());
    let lists = matches
        .get_many::<String>("options")
        .into_iter()
        .flatten()
        .map(String::as_str);
    let options = parse_options(lists).context("bad mount options")?;

    let target = options
        .target
        .context("missing required option: -o target=PATH")?;
    let target = fs::canonicalize(&target)
        .with_context(|| format!("target {} does not exist", target.display()))?;

    let cache_root = match options.cache {
        Some(cache) => cache,
        None => {
            let home = std::env::var_os("HOME").context("HOME not set and no -o cache=PATH")?;
            default_cache_root(home.as_ref(), &target)
        }
    };
    fs::create_dir_all(cache_root.join("file_data"))
        .with_context(|| format!("cannot create cache root {}", cache_root.display()))?;

    let store = MetaStore::open(&cache_root.join("metadata.db"))
        .context("cannot open metadata store")?
        .into_shared();

    let mut fuse_options = vec![
        MountOption::FSName("cachefs".to_string()),
        MountOption::DefaultPermissions,
    ];
    fuse_options.extend(options.fuse_options);
    debug!("mount options: {fuse_options:?}");

    println!("Setting up cachefs {} ...", crate_version!());
    println!("  Target       : {}", target.display());
    println!("  Cache        : {}", cache_root.display());
    println!("  Mount point  : {}", mountpoint.display());
    println!();
    println!("Unmount through:");
    println!("  fusermount -u {}", mountpoint.display());

    let filesystem = CacheFs::new(target, cache_root, store);
    fuser::mount2(filesystem, &mountpoint, &fuse_options).context("mount failed")?;
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("cachefs: {e:#}");
            ExitCode::FAILURE
        }
    }
}
