// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

fn build_cli() -> Command {
    Command::new("conary-repos")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Conary Contributors")
        .about("Conary repository: trove changesets and transactional commits")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("PATH")
                .global(true)
                .help("Repository configuration file (JSON)"),
        )
        .arg(
            Arg::new("db_path")
                .short('d')
                .long("db-path")
                .value_name("PATH")
                .global(true)
                .help("Trove database path, overrides the configuration"),
        )
        .arg(
            Arg::new("contents_dir")
                .long("contents-dir")
                .value_name("DIR")
                .global(true)
                .help("Content store directory, overrides the configuration"),
        )
        .arg(
            Arg::new("server_name")
                .long("server-name")
                .value_name("HOST")
                .action(ArgAction::Append)
                .global(true)
                .help("Host this repository serves (repeatable)"),
        )
        .subcommand(Command::new("init").about("Initialize the trove database and content store"))
        .subcommand(
            Command::new("commit")
                .about("Commit a changeset file")
                .arg(Arg::new("file").required(true).help("Changeset file to commit"))
                .arg(
                    Arg::new("mirror")
                        .long("mirror")
                        .action(ArgAction::SetTrue)
                        .help("Keep source timestamps (replicating another repository)"),
                )
                .arg(
                    Arg::new("require_signatures")
                        .long("require-signatures")
                        .action(ArgAction::SetTrue)
                        .help("Require trusted signatures on every trove"),
                ),
        )
        .subcommand(
            Command::new("show")
                .about("Print the troves in a changeset file")
                .arg(Arg::new("file").required(true).help("Changeset file to show")),
        )
        .subcommand(
            Command::new("export")
                .about("Write a changeset for a trove to a file")
                .arg(Arg::new("name").required(true).help("Trove name"))
                .arg(Arg::new("version").required(true).help("Trove version"))
                .arg(
                    Arg::new("flavor")
                        .short('f')
                        .long("flavor")
                        .default_value("")
                        .help("Trove flavor"),
                )
                .arg(
                    Arg::new("from")
                        .long("from")
                        .value_name("VERSION")
                        .help("Build a relative changeset from this version"),
                )
                .arg(
                    Arg::new("absolute")
                        .long("absolute")
                        .action(ArgAction::SetTrue)
                        .help("Include no old versions for member troves and files"),
                )
                .arg(
                    Arg::new("no_recurse")
                        .long("no-recurse")
                        .action(ArgAction::SetTrue)
                        .help("Leave member troves out"),
                )
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .required(true)
                        .help("Output file"),
                ),
        )
        .subcommand(
            Command::new("list")
                .about("List troves in the repository")
                .arg(Arg::new("name").help("Trove name (optional)")),
        )
        .subcommand(
            Command::new("cat")
                .about("Write stored contents to stdout")
                .arg(Arg::new("sha1").required(true).help("Content digest (hex)")),
        )
        .subcommand(
            Command::new("completions")
                .about("Generate shell completions")
                .arg(Arg::new("shell").required(true).help("bash, zsh, fish, elvish or powershell")),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Create man directory
    let out_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let man_dir = out_dir.join("man");
    fs::create_dir_all(&man_dir).expect("Failed to create man directory");

    let cmd = build_cli();
    let man = Man::new(cmd);
    let mut buffer = Vec::new();
    man.render(&mut buffer).expect("Failed to render man page");

    let man_path = man_dir.join("conary-repos.1");
    fs::write(&man_path, buffer).expect("Failed to write man page");
}
