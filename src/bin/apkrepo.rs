use std::collections::BTreeSet;
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::AtomicBool;

#[macro_use]
extern crate log;

use anyhow::{anyhow, bail, Context, Result};
use argh::FromArgs;

use apkrepo_rs::groups::Groups;
use apkrepo_rs::ingest::{self, EditRequest, IngestError};
use apkrepo_rs::store::{self, RepoStore};
use apkrepo_rs::validate;
use apkrepo_rs::RepoConfig;
use pkg_format_apkr::{delta, sign, sign::RepoKey};
use repometa::{AppId, AppMetadata, RepoIndex, Sha256Digest, SignerSet, VersionCode};

#[derive(FromArgs, Debug)]
/// Maintain a signed, statically served repository of application packages
/// with binary deltas between versions.
struct Args {
    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
enum Command {
    Add(AddArgs),
    Validate(ValidateArgs),
    List(ListArgs),
    Edit(EditArgs),
    Group(GroupArgs),
    GenerateDelta(GenerateDeltaArgs),
    ApplyDelta(ApplyDeltaArgs),
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "add")]
/// Ingest candidate packages and republish the repository atomically.
struct AddArgs {
    /// repository root directory
    #[argh(option, short = 'r')]
    repo: String,

    /// path to the repository signing key (PEM)
    #[argh(option, short = 'k')]
    signing_key: String,

    /// how many previous versions get a delta to the new head
    #[argh(option, default = "apkrepo_rs::config::DEFAULT_MAX_DELTAS")]
    max_deltas: usize,

    /// patch size cap as a percentage of the new package size
    #[argh(option, default = "apkrepo_rs::config::DEFAULT_PATCH_CAP_PERCENT")]
    patch_cap_percent: u8,

    /// worker threads for delta generation (default: one per core)
    #[argh(option)]
    workers: Option<usize>,

    /// maximum permitted decrease of the minimum platform version
    #[argh(option, default = "0")]
    platform_relaxation: u32,

    /// candidate package files, ingested in the given order
    #[argh(positional)]
    packages: Vec<String>,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "validate")]
/// Check the published tree against its signatures and digests.
struct ValidateArgs {
    /// repository root directory
    #[argh(option, short = 'r')]
    repo: String,

    /// path to the repository signing key (PEM)
    #[argh(option, short = 'k')]
    signing_key: String,

    /// additionally apply every published delta and compare the result
    #[argh(switch)]
    check_deltas: bool,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "list")]
/// Print applications, versions and deltas from the published tree.
struct ListArgs {
    /// repository root directory
    #[argh(option, short = 'r')]
    repo: String,

    /// only list this application
    #[argh(option, short = 'a')]
    app: Option<String>,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "edit")]
/// Change an application's label, icon, release notes or signer rotation.
struct EditArgs {
    /// repository root directory
    #[argh(option, short = 'r')]
    repo: String,

    /// path to the repository signing key (PEM)
    #[argh(option, short = 'k')]
    signing_key: String,

    /// application identity to edit
    #[argh(positional)]
    app: String,

    /// new display label
    #[argh(option)]
    label: Option<String>,

    /// path to a new icon blob
    #[argh(option)]
    icon: Option<String>,

    /// path to release notes for --notes-version
    #[argh(option)]
    notes: Option<String>,

    /// version code the release notes belong to
    #[argh(option)]
    notes_version: Option<String>,

    /// record a signer rotation from the current head to this
    /// comma-separated list of hex certificate fingerprints
    #[argh(option)]
    rotate: Option<String>,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "group")]
/// Manage operator-local application groups (create, add, remove, delete,
/// list).
struct GroupArgs {
    /// repository root directory
    #[argh(option, short = 'r')]
    repo: String,

    /// action: create, add, remove, delete or list
    #[argh(positional)]
    action: String,

    /// group name (all actions except list)
    #[argh(positional)]
    name: Option<String>,

    /// application identities
    #[argh(positional)]
    members: Vec<String>,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "generate-delta")]
/// Generate a binary patch between two package files.
struct GenerateDeltaArgs {
    /// old package file
    #[argh(positional)]
    old: String,

    /// new package file
    #[argh(positional)]
    new: String,

    /// output patch path
    #[argh(option, short = 'o')]
    out: String,

    /// fail if the patch exceeds this percentage of the new file's size
    #[argh(option)]
    patch_cap_percent: Option<u8>,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "apply-delta")]
/// Apply a binary patch to an old package file.
struct ApplyDeltaArgs {
    /// old package file
    #[argh(positional)]
    old: String,

    /// patch file
    #[argh(positional)]
    patch: String,

    /// output package path
    #[argh(option, short = 'o')]
    out: String,
}

fn parse_signer_set(spec: &str) -> Result<SignerSet> {
    let mut fingerprints = Vec::new();
    for part in spec.split(',').filter(|p| !p.is_empty()) {
        fingerprints.push(Sha256Digest::from_hex(part).map_err(|_| anyhow!("bad fingerprint {part:?}"))?);
    }
    let set = SignerSet::new(fingerprints);
    if set.is_empty() {
        bail!("signer set must not be empty");
    }
    Ok(set)
}

fn run_add(args: AddArgs) -> Result<()> {
    if args.packages.is_empty() {
        bail!("no candidate packages given");
    }

    let store = RepoStore::open(Path::new(&args.repo))?;
    let key = RepoKey::from_pem_file(Path::new(&args.signing_key))?;
    debug!("repository key algorithm: {}", key.algorithm());

    let config = RepoConfig {
        max_deltas: args.max_deltas,
        patch_cap_percent: args.patch_cap_percent,
        workers: args.workers,
        platform_relaxation: args.platform_relaxation,
    };
    let candidates: Vec<PathBuf> = args.packages.iter().map(PathBuf::from).collect();
    let cancel = AtomicBool::new(false);

    match ingest::ingest(&store, &key, &config, &candidates, &cancel) {
        Ok(report) => {
            for a in &report.accepted {
                println!("added {} {} ({})", a.id, a.version, a.path.display());
            }
            println!(
                "published repo sequence {}: {} delta(s) generated, {} skipped, {} pruned",
                report.repo_seq, report.deltas_generated, report.deltas_skipped, report.deltas_pruned
            );

            let groups = Groups::load(&store)?;
            let touched: BTreeSet<AppId> = report.touched.iter().cloned().collect();
            for (name, missing) in groups.partial_updates(&touched) {
                let missing: Vec<&str> = missing.iter().map(AppId::as_str).collect();
                warn!("group `{name}` was only partially updated, missing: {}", missing.join(", "));
            }
            Ok(())
        }
        Err(IngestError::Rejected(failures)) => {
            for f in &failures {
                println!("rejected {}: {}", f.path.display(), f.reject);
            }
            bail!("{} candidate(s) rejected, nothing was published", failures.len());
        }
        Err(IngestError::Inconsistent(issues)) => {
            for issue in &issues {
                println!("issue: {issue}");
            }
            bail!("repository failed validation with {} issue(s), refusing to publish", issues.len());
        }
        Err(IngestError::Tool(err)) => Err(err),
    }
}

fn run_validate(args: ValidateArgs) -> Result<()> {
    let store = RepoStore::open(Path::new(&args.repo))?;
    let key = RepoKey::from_pem_file(Path::new(&args.signing_key))?;
    let cancel = AtomicBool::new(false);

    let survey = validate::full_check(&store, &key, args.check_deltas, &cancel)?;
    for issue in &survey.issues {
        println!("issue: {issue}");
    }
    if !survey.is_consistent() {
        bail!("repository failed validation with {} issue(s)", survey.issues.len());
    }
    println!("repository is consistent: {} application(s), repo sequence {}", survey.metas.len(), survey.index.seq);
    Ok(())
}

/// Reads the published tree without taking the repository lock, the same
/// way download clients do.
fn run_list(args: ListArgs) -> Result<()> {
    let root = Path::new(&args.repo);
    let index_path = root.join(store::INDEX_FILE);
    if !index_path.exists() {
        println!("repository has no published index yet");
        return Ok(());
    }

    let framed = fs::read(&index_path).context(format!("failed to read path ({:?})", index_path.display()))?;
    let (_, payload) = sign::split(&framed)?;
    let index = RepoIndex::parse(std::str::from_utf8(payload)?)?;

    println!("repo sequence {} (timestamp {}), {} application(s)", index.seq, index.timestamp, index.entries.len());

    for entry in &index.entries {
        if let Some(filter) = &args.app {
            if entry.id.as_str() != filter {
                continue;
            }
        }

        let meta_path = root.join(store::metadata_path(&entry.id));
        let framed = fs::read(&meta_path).context(format!("failed to read path ({:?})", meta_path.display()))?;
        let (_, payload) = sign::split(&framed)?;
        let meta = AppMetadata::parse(std::str::from_utf8(payload)?)?;

        println!();
        println!("{} ({}), sequence {}", meta.id, meta.label, meta.seq);
        for v in &meta.versions {
            println!("  version {} ({}.{})  {} bytes  min platform {}", v.version, v.version.major(), v.version.minor(), v.size, v.min_platform);
        }
        for d in &meta.deltas {
            println!("  delta {} -> {}  {} bytes", d.from, d.to, d.patch_size);
        }
        for r in &meta.rotations {
            println!("  rotation [{}] -> [{}]", r.predecessor, r.successor);
        }
    }

    Ok(())
}

fn run_edit(args: EditArgs) -> Result<()> {
    let store = RepoStore::open(Path::new(&args.repo))?;
    let key = RepoKey::from_pem_file(Path::new(&args.signing_key))?;
    let id = AppId::new(&args.app)?;

    let notes = match (&args.notes, &args.notes_version) {
        (Some(path), Some(version)) => {
            let version = VersionCode::from_str(version)?;
            Some((version, PathBuf::from(path)))
        }
        (Some(_), None) | (None, Some(_)) => {
            bail!("--notes and --notes-version must be given together");
        }
        (None, None) => None,
    };

    let request = EditRequest {
        label: args.label,
        icon: args.icon.map(PathBuf::from),
        notes,
        rotate_to: args.rotate.as_deref().map(parse_signer_set).transpose()?,
    };

    match ingest::edit(&store, &key, &id, &request) {
        Ok(repo_seq) => {
            println!("edited {id}, published repo sequence {repo_seq}");
            Ok(())
        }
        Err(IngestError::Inconsistent(issues)) => {
            for issue in &issues {
                println!("issue: {issue}");
            }
            bail!("repository failed validation with {} issue(s), refusing to publish", issues.len());
        }
        Err(IngestError::Rejected(_)) => bail!("edit does not admit candidates"),
        Err(IngestError::Tool(err)) => Err(err),
    }
}

fn run_group(args: GroupArgs) -> Result<()> {
    let store = RepoStore::open(Path::new(&args.repo))?;
    let mut groups = Groups::load(&store)?;

    let ids = || -> Result<Vec<AppId>> {
        args.members.iter().map(|m| AppId::new(m).map_err(Into::into)).collect()
    };

    match args.action.as_str() {
        "list" => {
            for (name, members) in &groups.groups {
                let members: Vec<&str> = members.iter().map(AppId::as_str).collect();
                println!("{name}\t{}", members.join(","));
            }
            return Ok(());
        }
        action => {
            let name = args.name.as_deref().context(format!("group name required for `{action}`"))?;
            match action {
                "create" => groups.create(name, ids()?)?,
                "add" => groups.add(name, ids()?)?,
                "remove" => groups.remove(name, &ids()?)?,
                "delete" => groups.delete(name)?,
                other => bail!("unknown group action {other:?} (expected create, add, remove, delete or list)"),
            }
        }
    }

    groups.save(&store)?;
    println!("groups updated");
    Ok(())
}

fn run_generate_delta(args: GenerateDeltaArgs) -> Result<()> {
    let new_path = Path::new(&args.new);
    let cap = match args.patch_cap_percent {
        Some(percent) => {
            let new_size = fs::metadata(new_path).context(format!("failed to get metadata, path ({:?})", new_path.display()))?.len();
            Some(new_size.saturating_mul(percent as u64) / 100)
        }
        None => None,
    };

    let cancel = AtomicBool::new(false);
    let stats = delta::generate(Path::new(&args.old), new_path, Path::new(&args.out), cap, &cancel)?;
    println!("wrote {} ({} bytes)", args.out, stats.patch_size);
    Ok(())
}

fn run_apply_delta(args: ApplyDeltaArgs) -> Result<()> {
    let cancel = AtomicBool::new(false);
    delta::apply(Path::new(&args.old), Path::new(&args.patch), Path::new(&args.out), &cancel)?;
    println!("wrote {}", args.out);
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let args: Args = argh::from_env();

    match args.command {
        Command::Add(a) => run_add(a)?,
        Command::Validate(a) => run_validate(a)?,
        Command::List(a) => run_list(a)?,
        Command::Edit(a) => run_edit(a)?,
        Command::Group(a) => run_group(a)?,
        Command::GenerateDelta(a) => run_generate_delta(a)?,
        Command::ApplyDelta(a) => run_apply_delta(a)?,
    }

    Ok(())
}
