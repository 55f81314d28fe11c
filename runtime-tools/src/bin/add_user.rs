//! Appends one account to a user file, salting and hashing the password the
//! same way `CredentialStore` does on auto-registration. For seeding test
//! fixtures or provisioning an account outside of the setup packet flow.

use authority::password::salted_sha256_hex;
use authority::{random_salt, UserRecord};
use clap::{App, Arg};
use std::fs;

fn main() {
    let matches = App::new("Add User")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Appends a new account to a user file.")
        .arg(Arg::with_name("USER_FILE").help("Path to the user file").required(true))
        .arg(Arg::with_name("NAME").help("Account name").required(true))
        .arg(Arg::with_name("PASSWORD").help("Plaintext password").required(true))
        .arg(Arg::with_name("AVATAR").help("Avatar id").required(false))
        .get_matches();

    let user_file_path = matches.value_of("USER_FILE").unwrap();
    let name = matches.value_of("NAME").unwrap();
    let password = matches.value_of("PASSWORD").unwrap();
    let avatar = matches.value_of("AVATAR").unwrap_or(authority::record::DEFAULT_AVATAR);

    let contents = fs::read_to_string(user_file_path).unwrap_or_default();
    let mut next_id = 1u64;
    for line in contents.lines() {
        if let Some(record) = UserRecord::parse_line(line.trim()) {
            if record.name == name {
                eprintln!("account `{}` already exists with id {}", name, record.id);
                std::process::exit(1);
            }
            next_id = next_id.max(record.id + 1);
        }
    }

    let salt = random_salt();
    let password_hash = salted_sha256_hex(password, &salt);
    let mut record = UserRecord::new(next_id, name, password_hash, salt);
    record.avatar = avatar.to_string();

    authority::lists::append_line(user_file_path.as_ref(), &record.to_line()).expect("failed to write user file");
    println!("added `{}` as id {}", name, next_id);
}
