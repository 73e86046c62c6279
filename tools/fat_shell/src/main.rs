//! Inspect and modify FAT16/FAT32 disk images through the `fat_fs` engine.
//!
//! ```text
//! fat_shell [-v]... [-p PARTITION] <image> <command>...
//! fat_shell <image> mkimage <size-MiB> [fat16|fat32]
//! ```

mod commands;
mod image;
mod logger;

use std::error::Error;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::{env, io};

use fat_fs::FatFs;

use crate::image::Image;

const USAGE: &str = "usage: fat_shell [-v]... [-p PARTITION] <image> <command>...
commands:
  ls                 list the current directory
  cat NAME           print a file
  cd DIR             enter a directory (`..` goes back up)
  put NAME TEXT      append TEXT to NAME, creating it
  copy SRC DST       copy SRC into DST byte by byte
  mkimage MIB [fat16|fat32]   create and format <image>";

struct Args {
    verbosity: u8,
    partition: u8,
    image: PathBuf,
    words: Vec<String>,
}

impl Args {
    fn parse(mut raw: impl Iterator<Item = String>) -> Result<Self, String> {
        let mut verbosity = 0;
        let mut partition = 0;
        let image = loop {
            let arg = raw.next().ok_or("missing image path")?;
            match arg.as_str() {
                "-v" => verbosity += 1,
                "-vv" => verbosity += 2,
                "-p" => {
                    let value = raw.next().ok_or("-p needs a partition number")?;
                    partition = value.parse().map_err(|_| format!("bad partition `{value}`"))?;
                }
                "-h" | "--help" => return Err(USAGE.into()),
                _ => break PathBuf::from(arg),
            }
        };
        Ok(Self { verbosity, partition, image, words: raw.collect() })
    }
}

fn mkimage(args: &Args) -> Result<(), Box<dyn Error>> {
    let size: u32 = match args.words.get(1) {
        Some(size) => size.parse().map_err(|_| format!("bad size `{size}`"))?,
        None => return Err("mkimage: missing size".into()),
    };
    let fat_type = match args.words.get(2).map(String::as_str) {
        None | Some("fat32") => fatfs::FatType::Fat32,
        Some("fat16") => fatfs::FatType::Fat16,
        Some(other) => return Err(format!("mkimage: unknown type `{other}`").into()),
    };
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(&args.image)?;
    image::create(file, size, fat_type)?;
    Ok(())
}

fn run(args: Args) -> Result<(), Box<dyn Error>> {
    logger::init(logger::level_for(args.verbosity))?;

    if args.words.first().map(String::as_str) == Some("mkimage") {
        return mkimage(&args);
    }
    let script = commands::parse(&args.words)?;

    let file = OpenOptions::new().read(true).write(true).open(&args.image)?;
    let device = Image::new(file)?;
    log::info!("{}: {} sectors", args.image.display(), device.sectors());
    let mut fs = FatFs::new(device);
    fs.mount(args.partition)?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let result = script.iter().try_for_each(|command| commands::run(&mut fs, command, &mut out));
    // Flush what the script managed to do even if a later command failed.
    let unmounted = fs.unmount();
    result?;
    unmounted?;
    fs.into_device().into_inner().sync_all()?;
    Ok(())
}

fn main() -> ExitCode {
    let args = match Args::parse(env::args().skip(1)) {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::from(2);
        }
    };
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("fat_shell: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(line: &str) -> Result<Args, String> {
        Args::parse(line.split_whitespace().map(String::from))
    }

    #[test]
    fn flags_come_before_the_image() {
        let parsed = args("-v -v -p 1 card.img cd SUB ls").unwrap();
        assert_eq!(parsed.verbosity, 2);
        assert_eq!(parsed.partition, 1);
        assert_eq!(parsed.image, PathBuf::from("card.img"));
        assert_eq!(parsed.words, ["cd", "SUB", "ls"]);
    }

    #[test]
    fn missing_image_is_an_error() {
        assert!(args("-v").is_err());
        assert!(args("-p x card.img ls").is_err());
    }
}
