// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

/// Common argument: repository directory
fn repo_arg() -> Arg {
    Arg::new("repo")
        .short('r')
        .long("repo")
        .value_name("DIR")
        .required(true)
        .help("Repository directory")
}

fn flag(name: &'static str, help: &'static str) -> Arg {
    Arg::new(name).long(name).action(ArgAction::SetTrue).help(help)
}

fn build_cli() -> Command {
    Command::new("conary-repo")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Conary Contributors")
        .about("Maintain Conary repositories and apply changesets to a root")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("PATH")
                .global(true)
                .help("Configuration file"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .global(true)
                .help("Log at debug level"),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("init")
                .about("Create an empty repository")
                .arg(Arg::new("repo").required(true).help("Repository directory")),
        )
        .subcommand(
            Command::new("commit")
                .about("Commit a changeset file into a repository")
                .arg(repo_arg())
                .arg(Arg::new("changeset").required(true).help("Changeset file"))
                .arg(flag("mirror", "Keep trove digests as sent"))
                .arg(flag("hidden", "Commit the troves hidden")),
        )
        .subcommand(
            Command::new("changeset")
                .about("Build a changeset from repository contents")
                .arg(repo_arg())
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .required(true)
                        .help("Output file"),
                )
                .arg(
                    Arg::new("troves")
                        .required(true)
                        .num_args(1..)
                        .help("Troves to include, as name[=version][[flavor]]"),
                ),
        )
        .subcommand(
            Command::new("list")
                .about("List trove versions on a label")
                .arg(repo_arg())
                .arg(Arg::new("label").short('l').long("label").help("Label to list"))
                .arg(Arg::new("names").num_args(0..).help("Trove names")),
        )
        .subcommand(
            Command::new("gc")
                .about("Drop hidden troves and unreferenced contents")
                .arg(repo_arg()),
        )
        .subcommand(
            Command::new("apply")
                .about("Apply a changeset file to the configured root")
                .arg(Arg::new("changeset").required(true).help("Changeset file"))
                .arg(flag("replace-files", "Take over files owned by other troves"))
                .arg(flag("strict-merge", "Fail on config merge conflicts"))
                .arg(flag("test", "Show what would change without touching anything")),
        )
        .subcommand(
            Command::new("update")
                .about("Install or update troves from a repository with their requirements")
                .arg(repo_arg())
                .arg(
                    Arg::new("troves")
                        .required(true)
                        .num_args(1..)
                        .help("Troves to update, as name[=version][[flavor]]"),
                ),
        )
        .subcommand(Command::new("rollback").about("Undo the most recent update"))
        .subcommand(
            Command::new("query")
                .about("Show installed troves")
                .arg(Arg::new("spec").help("name[=version]")),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let manifest_dir = match env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(e) => {
            println!("cargo:warning=CARGO_MANIFEST_DIR not set: {}", e);
            return;
        }
    };
    let man_dir = manifest_dir.join("man");

    if let Err(e) = fs::create_dir_all(&man_dir) {
        println!("cargo:warning=Failed to create man directory: {}", e);
        return;
    }

    let man = Man::new(build_cli());
    let mut buffer = Vec::new();
    if let Err(e) = man.render(&mut buffer) {
        println!("cargo:warning=Failed to render man page: {}", e);
        return;
    }

    let man_path = man_dir.join("conary-repo.1");
    if let Err(e) = fs::write(&man_path, buffer) {
        println!("cargo:warning=Failed to write man page: {}", e);
    }
}
