use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::process::Command;

/// Trimmed stdout of a command, or None if it couldn't run or failed.
fn command_line(cmd: &str, args: &[&str]) -> Option<String> {
    let out = Command::new(cmd).args(args).output().ok()?;
    if !out.status.success() {
        return None;
    }
    let text = String::from_utf8(out.stdout).ok()?;
    Some(text.trim().to_string())
}

fn main() {
    // embedded templates, schema, and the current git revision
    println!("cargo:rerun-if-changed=templates");
    println!("cargo:rerun-if-changed=sql");
    println!("cargo:rerun-if-changed=.git/HEAD");
    // Builds from a tarball have no git, and that's fine.
    let sha = command_line("git", &["rev-parse", "HEAD"]).unwrap_or_else(|| "unknown".to_string());
    let date = command_line("date", &["-u", "+%Y-%m-%dT%H:%M:%SZ"]).unwrap_or_default();

    let out_dir = PathBuf::from(std::env::var("OUT_DIR").expect("cargo always sets OUT_DIR"));
    let mut f = File::create(out_dir.join("VERSION.txt")).expect("couldn't open VERSION.txt file for write");
    writeln!(f, "{}", sha).expect("couldn't write sha");
    writeln!(f, "{}", date).expect("couldn't write date");
}
