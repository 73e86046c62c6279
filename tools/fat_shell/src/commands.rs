use std::error::Error;
use std::io::Write;

use fat_fs::{Attributes, BlockDevice, DirEntryInfo, FatFs, FileSystem, OpenMode, ShortName};

/// Entries shown by one `ls`.
const LIST_CAPACITY: usize = 512;

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Ls,
    Cat(String),
    Cd(String),
    Put(String, String),
    Copy(String, String),
}

/// Split the words after the image path into commands.
pub fn parse(words: &[String]) -> Result<Vec<Command>, String> {
    let mut words = words.iter();
    let mut script = Vec::new();
    while let Some(word) = words.next() {
        let command = match word.as_str() {
            "ls" => Command::Ls,
            "cat" => Command::Cat(arg(&mut words, "cat")?),
            "cd" => Command::Cd(arg(&mut words, "cd")?),
            "put" => Command::Put(arg(&mut words, "put")?, arg(&mut words, "put")?),
            "copy" => Command::Copy(arg(&mut words, "copy")?, arg(&mut words, "copy")?),
            other => return Err(format!("unknown command `{other}`")),
        };
        script.push(command);
    }
    if script.is_empty() {
        return Err("no command given".into());
    }
    Ok(script)
}

fn arg(words: &mut std::slice::Iter<'_, String>, command: &str) -> Result<String, String> {
    words.next().cloned().ok_or_else(|| format!("{command}: missing argument"))
}

pub fn run<D: BlockDevice>(fs: &mut FatFs<D>, command: &Command, out: &mut impl Write) -> Result<(), Box<dyn Error>> {
    match command {
        Command::Ls => ls(fs, out),
        Command::Cat(name) => cat(fs, name, out),
        Command::Cd(name) => Ok(fs.change_dir(name)?),
        Command::Put(name, text) => put(fs, name, text),
        Command::Copy(src, dst) => copy(fs, src, dst),
    }
}

fn ls<D: BlockDevice>(fs: &mut FatFs<D>, out: &mut impl Write) -> Result<(), Box<dyn Error>> {
    let blank = DirEntryInfo { name: ShortName::new(), attributes: Attributes::empty(), size: 0, first_cluster: 0 };
    let mut entries = vec![blank; LIST_CAPACITY];
    let count = fs.read_dir(&mut entries)?;
    for entry in &entries[..count] {
        if entry.is_dir() {
            writeln!(out, "{:<12} {:>10}", entry.name_str(), "<DIR>")?;
        } else {
            writeln!(out, "{:<12} {:>10}", entry.name_str(), entry.size)?;
        }
    }
    if count == LIST_CAPACITY {
        log::warn!("listing stopped after {} entries", LIST_CAPACITY);
    }
    Ok(())
}

fn cat<D: BlockDevice>(fs: &mut FatFs<D>, name: &str, out: &mut impl Write) -> Result<(), Box<dyn Error>> {
    let mut file = fs.open(name, OpenMode::Read)?;
    let mut chunk = [0u8; 512];
    loop {
        let n = fs.read(&mut file, &mut chunk)?;
        if n == 0 {
            break;
        }
        out.write_all(&chunk[..n])?;
    }
    fs.close(file)?;
    Ok(())
}

fn put<D: BlockDevice>(fs: &mut FatFs<D>, name: &str, text: &str) -> Result<(), Box<dyn Error>> {
    let mut file = fs.open(name, OpenMode::Append)?;
    let written = fs.write(&mut file, text.as_bytes())?;
    log::info!("{}: {} bytes", file.name(), file.len());
    fs.close(file)?;
    if written < text.len() {
        return Err(fat_fs::Error::NoSpace.into());
    }
    Ok(())
}

/// Byte-at-a-time copy through two handles sharing the one sector buffer.
fn copy<D: BlockDevice>(fs: &mut FatFs<D>, src: &str, dst: &str) -> Result<(), Box<dyn Error>> {
    let mut reader = fs.open(src, OpenMode::Read)?;
    let mut writer = fs.open(dst, OpenMode::Write)?;
    while let Some(byte) = fs.read_byte(&mut reader)? {
        fs.write_byte(&mut writer, byte)?;
    }
    log::info!("copied {} bytes from {} to {}", writer.len(), reader.name(), writer.name());
    fs.close(reader)?;
    fs.close(writer)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{self, Image};
    use fat_fs::Error as FsError;
    use std::io::Cursor;

    fn words(line: &str) -> Vec<String> {
        line.split_whitespace().map(String::from).collect()
    }

    fn mounted() -> FatFs<Image<Cursor<Vec<u8>>>> {
        let inner = image::create(Cursor::new(Vec::new()), 16, fatfs::FatType::Fat16).unwrap();
        let mut fs = FatFs::new(Image::new(inner).unwrap());
        fs.mount(0).unwrap();
        fs
    }

    fn run_line<D: BlockDevice>(fs: &mut FatFs<D>, line: &str) -> Result<String, Box<dyn Error>> {
        let mut out = Vec::new();
        for command in parse(&words(line))? {
            run(fs, &command, &mut out)?;
        }
        Ok(String::from_utf8(out).unwrap())
    }

    #[test]
    fn parse_chains_commands() {
        let script = parse(&words("cd SUB ls cat A.TXT")).unwrap();
        assert_eq!(
            script,
            vec![Command::Cd("SUB".into()), Command::Ls, Command::Cat("A.TXT".into())]
        );
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!(parse(&words("")).is_err());
        assert!(parse(&words("frobnicate")).is_err());
        assert!(parse(&words("copy ONLY.TXT")).is_err());
    }

    #[test]
    fn put_then_cat() {
        let mut fs = mounted();
        run_line(&mut fs, "put NOTE.TXT hello").unwrap();
        run_line(&mut fs, "put NOTE.TXT _world").unwrap();
        assert_eq!(run_line(&mut fs, "cat note.txt").unwrap(), "hello_world");
    }

    #[test]
    fn ls_lists_sizes() {
        let mut fs = mounted();
        run_line(&mut fs, "put A.TXT abc").unwrap();
        let listing = run_line(&mut fs, "ls").unwrap();
        assert!(listing.lines().any(|l| l.starts_with("A.TXT") && l.ends_with(" 3")), "{listing}");
    }

    #[test]
    fn copy_duplicates_content() {
        let mut fs = mounted();
        let text = "x".repeat(3000);
        run_line(&mut fs, &std::format!("put SRC.TXT {text}")).unwrap();
        run_line(&mut fs, "copy SRC.TXT DST.TXT").unwrap();
        assert_eq!(run_line(&mut fs, "cat DST.TXT").unwrap(), text);
    }

    #[test]
    fn cat_missing_file_reports_not_found() {
        let mut fs = mounted();
        let err = run_line(&mut fs, "cat NOPE.TXT").unwrap_err();
        assert_eq!(err.downcast_ref::<FsError>(), Some(&FsError::FileNotFound));
    }

    #[test]
    fn cd_into_file_fails() {
        let mut fs = mounted();
        run_line(&mut fs, "put A.TXT a").unwrap();
        let err = run_line(&mut fs, "cd A.TXT").unwrap_err();
        assert_eq!(err.downcast_ref::<FsError>(), Some(&FsError::EntryNotDirectory));
    }
}
