// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

fn repeated(name: &'static str, long: &'static str, help: &'static str) -> Arg {
    Arg::new(name)
        .long(long)
        .value_name("NAME")
        .action(ArgAction::Append)
        .help(help)
}

fn build_cli() -> Command {
    Command::new("pungi")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Pungi Contributors")
        .about("Distribution compose tool")
        .subcommand_required(true)
        .subcommand(
            Command::new("compose")
                .about("Run a compose")
                .arg(
                    Arg::new("config")
                        .short('c')
                        .long("config")
                        .value_name("PATH")
                        .required(true)
                        .help("Compose configuration (TOML)"),
                )
                .arg(
                    Arg::new("target_dir")
                        .long("target-dir")
                        .value_name("DIR")
                        .default_value(".")
                        .help("Directory the compose directory is created in"),
                )
                .arg(Arg::new("label").long("label").help("Compose label, e.g. RC-1.0 or Beta-1"))
                .arg(
                    Arg::new("compose_date")
                        .long("compose-date")
                        .value_name("YYYYMMDD")
                        .help("Compose date (default: today)"),
                )
                .arg(Arg::new("respin").long("respin").help("Respin number"))
                .arg(repeated(
                    "old_compose",
                    "old-compose",
                    "Older compose to reuse results from",
                ))
                .arg(repeated("just_phase", "just-phase", "Run only this phase"))
                .arg(repeated("skip_phase", "skip-phase", "Skip this phase"))
                .arg(
                    Arg::new("no_latest_link")
                        .long("no-latest-link")
                        .action(ArgAction::SetTrue)
                        .help("Do not update the latest-* symlink"),
                )
                .arg(
                    Arg::new("verbose")
                        .short('v')
                        .long("verbose")
                        .action(ArgAction::SetTrue)
                        .help("Debug output"),
                )
                .arg(
                    Arg::new("quiet")
                        .short('q')
                        .long("quiet")
                        .action(ArgAction::SetTrue)
                        .help("Warnings and errors only"),
                ),
        )
        .subcommand(
            Command::new("completions")
                .about("Generate shell completion scripts")
                .arg(
                    Arg::new("shell")
                        .required(true)
                        .value_parser(["bash", "elvish", "fish", "powershell", "zsh"])
                        .help("Shell type"),
                ),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let out_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let man_dir = out_dir.join("man");
    fs::create_dir_all(&man_dir).expect("Failed to create man directory");

    let man = Man::new(build_cli());
    let mut buffer = Vec::new();
    man.render(&mut buffer).expect("Failed to render man page");

    let man_path = man_dir.join("pungi.1");
    fs::write(&man_path, buffer).expect("Failed to write man page");
}
