//! Flips the ban flag on one account in place, via a temp-file-and-rename
//! swap so a crash mid-write can never leave the user file half rewritten —
//! the same pattern `CredentialStore`'s internal ban clearing uses.

use authority::UserRecord;
use clap::{App, Arg};
use std::fs;
use std::io::Write;
use std::path::Path;

fn main() {
    let matches = App::new("Ban User")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Bans or unbans an account by name.")
        .arg(Arg::with_name("USER_FILE").help("Path to the user file").required(true))
        .arg(Arg::with_name("NAME").help("Account name").required(true))
        .arg(Arg::with_name("unban").long("unban").help("Lift the ban instead of applying one"))
        .arg(
            Arg::with_name("EXPIRE_EPOCH")
                .long("expire")
                .takes_value(true)
                .help("Unix epoch seconds the ban lifts at; omitted or 0 means permanent"),
        )
        .get_matches();

    let user_file_path = matches.value_of("USER_FILE").unwrap();
    let name = matches.value_of("NAME").unwrap();
    let unban = matches.is_present("unban");
    let expire_epoch: i64 = matches.value_of("EXPIRE_EPOCH").and_then(|v| v.parse().ok()).unwrap_or(0);

    let contents = fs::read_to_string(user_file_path).expect("failed to read user file");
    let dir = Path::new(user_file_path).parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).expect("failed to create temp file");

    let mut found = false;
    for line in contents.lines() {
        let trimmed = line.trim();
        match UserRecord::parse_line(trimmed) {
            Some(mut record) if record.name == name => {
                found = true;
                record.banned = !unban;
                record.ban_expire_epoch = if unban { 0 } else { expire_epoch };
                writeln!(tmp, "{}", record.to_line()).expect("failed to write temp file");
            }
            _ => writeln!(tmp, "{}", line).expect("failed to write temp file"),
        }
    }

    if !found {
        eprintln!("no account named `{}`", name);
        std::process::exit(1);
    }

    tmp.persist(user_file_path).expect("failed to persist user file");
    println!("{} `{}`", if unban { "unbanned" } else { "banned" }, name);
}
