//! Build script rendering the `msh-demo` manual pages.
//!
//! One page covers the binary and one more is written per subcommand, named
//! `msh-demo-<subcommand>.1` as `git` and `cargo` name theirs.

use std::{env, fs, path::PathBuf};

use clap::CommandFactory;
use clap_mangen::Man;

#[path = "src/cli.rs"]
mod cli;

const MAN_DIR_VAR: &str = "MSH_DEMO_MAN_DIR";

fn render(man: &Man, path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let mut buf: Vec<u8> = Vec::new();
    man.render(&mut buf)?;
    fs::write(path, buf)?;
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=src/cli.rs");
    println!("cargo:rerun-if-env-changed={MAN_DIR_VAR}");

    let out_dir = env::var_os(MAN_DIR_VAR)
        .map_or_else(|| PathBuf::from("target/generated-man"), PathBuf::from);
    fs::create_dir_all(&out_dir)?;

    let cmd = cli::Cli::command();
    let bin = cmd.get_name().to_owned();
    for sub in cmd.get_subcommands() {
        let page = format!("{bin}-{}", sub.get_name());
        render(&Man::new(sub.clone()).title(page.clone()), out_dir.join(format!("{page}.1")))?;
    }
    render(&Man::new(cmd), out_dir.join(format!("{bin}.1")))
}
