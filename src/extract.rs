//! Materializes a typed chunk stream as files under a directory.

use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use log::debug;

use crate::{
    error::{Error, Result},
    streamer::{Chunk, Member, Streamer},
    util::{close_buffered, normalize_write_error},
    PG_DIR_CREATE_MODE, PG_FILE_CREATE_MODE,
};

/// Rewrites a symlink target before the link is created.
pub type LinkMap = Box<dyn Fn(&str) -> String>;

/// Told about every path the extractor is about to create.
pub type ReportOutputFile = Box<dyn FnMut(&Path)>;

#[cfg(unix)]
mod sys {
    use std::{fs::File, io, path::Path};

    use rustix::fs::{chmod, mkdir, open, symlink, Mode, OFlags, RawMode};

    pub fn create_dir(path: &Path, mode: u32) -> io::Result<()> {
        Ok(mkdir(path, Mode::from_raw_mode(mode as RawMode))?)
    }

    pub fn create_file(path: &Path, mode: u32) -> io::Result<File> {
        let fd = open(
            path,
            OFlags::CREATE | OFlags::TRUNC | OFlags::WRONLY | OFlags::CLOEXEC,
            Mode::from_raw_mode(mode as RawMode),
        )?;
        Ok(File::from(fd))
    }

    pub fn create_symlink(target: &str, path: &Path) -> io::Result<()> {
        Ok(symlink(target, path)?)
    }

    pub fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
        Ok(chmod(path, Mode::from_raw_mode((mode & 0o7777) as RawMode))?)
    }
}

#[cfg(not(unix))]
mod sys {
    use std::{fs::File, io, path::Path};

    pub fn create_dir(path: &Path, _mode: u32) -> io::Result<()> {
        std::fs::create_dir(path)
    }

    pub fn create_file(path: &Path, _mode: u32) -> io::Result<File> {
        File::create(path)
    }

    pub fn create_symlink(_target: &str, _path: &Path) -> io::Result<()> {
        Err(io::ErrorKind::Unsupported.into())
    }

    // No permission bits: the creation mode stands.
    pub fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
        Ok(())
    }
}

/// Returns true if a directory that already exists at `path` may be reused.
///
/// The server's base directory and tablespace directories are often created
/// ahead of the extraction, as are the WAL directories.
fn should_allow_existing_directory(path: &str) -> bool {
    let filename = path.rsplit('/').next().unwrap_or(path);

    if matches!(
        filename,
        "pg_wal" | "pg_xlog" | "archive_status" | "summaries" | "pg_tblspc"
    ) {
        return true;
    }

    if filename.bytes().all(|b| b.is_ascii_digit()) {
        // a tablespace OID directly under pg_tblspc
        return path
            .strip_suffix(filename)
            .is_some_and(|parent| parent.ends_with("/pg_tblspc/"));
    }

    false
}

/// The file extractor.
pub struct Extractor {
    basepath: PathBuf,
    link_map: Option<LinkMap>,
    report_output_file: Option<ReportOutputFile>,
    filename: String,
    file: Option<BufWriter<File>>,
}

impl Extractor {
    pub fn new(basepath: impl Into<PathBuf>) -> Self {
        Self {
            basepath: basepath.into(),
            link_map: None,
            report_output_file: None,
            filename: String::new(),
            file: None,
        }
    }

    pub fn with_link_map(mut self, link_map: impl Fn(&str) -> String + 'static) -> Self {
        self.link_map = Some(Box::new(link_map));
        self
    }

    pub fn with_report_output_file(mut self, report: impl FnMut(&Path) + 'static) -> Self {
        self.report_output_file = Some(Box::new(report));
        self
    }

    fn extract_directory(&self, member: &Member) -> Result<()> {
        let path = Path::new(&self.filename);
        match sys::create_dir(path, PG_DIR_CREATE_MODE) {
            Ok(()) => {}
            Err(e)
                if e.kind() == io::ErrorKind::AlreadyExists
                    && should_allow_existing_directory(&self.filename) =>
            {
                debug!("reusing existing directory {}", self.filename);
            }
            Err(e) => return Err(Error::io("create directory", path, e)),
        }

        sys::set_mode(path, member.mode)
            .map_err(|e| Error::io("set permissions on directory", path, e))
    }

    fn extract_link(&self, member: &Member) -> Result<()> {
        let target = match &self.link_map {
            Some(link_map) => link_map(&member.linktarget),
            None => member.linktarget.clone(),
        };
        debug!("symlink {} -> {target}", self.filename);

        let path = Path::new(&self.filename);
        sys::create_symlink(&target, path).map_err(|e| {
            Error::io(
                "create symbolic link from",
                format!("{}\" to \"{target}", self.filename),
                e,
            )
        })
    }

    fn create_file(&self, member: &Member) -> Result<BufWriter<File>> {
        let path = Path::new(&self.filename);
        let file = sys::create_file(path, PG_FILE_CREATE_MODE)
            .map_err(|e| Error::io("create file", path, e))?;
        sys::set_mode(path, member.mode)
            .map_err(|e| Error::io("set permissions on file", path, e))?;
        Ok(BufWriter::new(file))
    }

    fn close_file(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            close_buffered(file).map_err(|e| Error::io("close file", &self.filename, e))?;
        }
        Ok(())
    }
}

impl Streamer for Extractor {
    fn content(&mut self, chunk: Chunk<'_>) -> Result<()> {
        match chunk {
            Chunk::MemberHeader(member, _) => {
                let fullpath = format!("{}/{}", self.basepath.display(), member.pathname);
                self.filename = match fullpath.strip_suffix('/') {
                    Some(stripped) => stripped.to_string(),
                    None => fullpath,
                };

                if member.is_directory {
                    self.extract_directory(member)?;
                } else if member.is_link {
                    self.extract_link(member)?;
                } else {
                    self.file = Some(self.create_file(member)?);
                }

                if let Some(report) = &mut self.report_output_file {
                    report(Path::new(&self.filename));
                }
                Ok(())
            }

            Chunk::MemberContents(_, data) => match &mut self.file {
                Some(file) => file.write_all(data).map_err(|e| {
                    Error::io("write to file", &self.filename, normalize_write_error(e))
                }),
                None => Ok(()),
            },

            Chunk::MemberTrailer(..) => self.close_file(),

            Chunk::ArchiveTrailer(_) => Ok(()),

            Chunk::Unknown(_) => Err(Error::UnexpectedChunk(chunk.context())),
        }
    }

    fn finalize(&mut self) -> Result<()> {
        if self.file.is_some() {
            self.close_file()?;
            return Err(Error::UnfinishedMember);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::{cell::RefCell, rc::Rc};

    use similar_asserts::assert_eq;
    use tempfile::TempDir;

    use super::*;

    fn feed(extractor: &mut Extractor, member: &Member, contents: &[&[u8]]) {
        extractor.content(Chunk::MemberHeader(member, &[])).unwrap();
        for data in contents {
            extractor
                .content(Chunk::MemberContents(member, data))
                .unwrap();
        }
        extractor.content(Chunk::MemberTrailer(member, &[])).unwrap();
    }

    #[test]
    fn test_allow_existing_directory() {
        assert!(should_allow_existing_directory("/data/pg_wal"));
        assert!(should_allow_existing_directory("/data/pg_wal/archive_status"));
        assert!(should_allow_existing_directory("/data/pg_tblspc"));
        assert!(should_allow_existing_directory("/data/pg_wal/summaries"));
        assert!(should_allow_existing_directory("/data/pg_tblspc/16384"));
        assert!(!should_allow_existing_directory("/data/base/16384"));
        assert!(!should_allow_existing_directory("/data/pg_tblspc/16384/x"));
        assert!(!should_allow_existing_directory("/data/base"));
    }

    #[test]
    fn test_extract_files_and_report() {
        let tmp = TempDir::new().unwrap();
        let reported = Rc::new(RefCell::new(vec![]));
        let sink = Rc::clone(&reported);
        let mut extractor = Extractor::new(tmp.path())
            .with_report_output_file(move |p| sink.borrow_mut().push(p.to_path_buf()));

        let dir = Member {
            pathname: "base/".into(),
            mode: 0o750,
            is_directory: true,
            ..Default::default()
        };
        feed(&mut extractor, &dir, &[]);
        let file = Member::file("base/1", 6, 0o640);
        feed(&mut extractor, &file, &[&b"abc"[..], &b""[..], &b"def"[..]]);
        extractor.content(Chunk::ArchiveTrailer(&[])).unwrap();
        extractor.finalize().unwrap();

        assert_eq!(
            std::fs::read(tmp.path().join("base/1")).unwrap(),
            b"abcdef".to_vec()
        );
        assert_eq!(
            *reported.borrow(),
            vec![tmp.path().join("base"), tmp.path().join("base/1")]
        );

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = |p: &str| {
                std::fs::metadata(tmp.path().join(p))
                    .unwrap()
                    .permissions()
                    .mode()
                    & 0o7777
            };
            assert_eq!(mode("base"), 0o750);
            assert_eq!(mode("base/1"), 0o640);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_link_map() {
        let tmp = TempDir::new().unwrap();
        let mut extractor = Extractor::new(tmp.path()).with_link_map(|target| {
            if target == "/old" {
                "/new".to_string()
            } else {
                target.to_string()
            }
        });

        let link = Member {
            pathname: "16384".into(),
            is_link: true,
            linktarget: "/old".into(),
            ..Default::default()
        };
        feed(&mut extractor, &link, &[]);
        assert_eq!(
            std::fs::read_link(tmp.path().join("16384")).unwrap(),
            Path::new("/new")
        );
    }

    #[test]
    fn test_existing_directory() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("pg_wal")).unwrap();
        std::fs::create_dir(tmp.path().join("base")).unwrap();
        let mut extractor = Extractor::new(tmp.path());

        let wal = Member {
            pathname: "pg_wal".into(),
            mode: 0o700,
            is_directory: true,
            ..Default::default()
        };
        feed(&mut extractor, &wal, &[]);

        let base = Member {
            pathname: "base".into(),
            ..wal
        };
        let err = extractor
            .content(Chunk::MemberHeader(&base, &[]))
            .unwrap_err();
        assert!(err.to_string().starts_with("could not create directory"));
    }

    #[test]
    fn test_unfinished_member() {
        let tmp = TempDir::new().unwrap();
        let mut extractor = Extractor::new(tmp.path());
        let file = Member::file("partial", 10, 0o600);
        extractor.content(Chunk::MemberHeader(&file, &[])).unwrap();
        extractor
            .content(Chunk::MemberContents(&file, b"abc"))
            .unwrap();
        assert!(matches!(
            extractor.finalize().unwrap_err(),
            Error::UnfinishedMember
        ));
        assert!(matches!(
            extractor.content(Chunk::Unknown(b"x")).unwrap_err(),
            Error::UnexpectedChunk(_)
        ));
    }
}
