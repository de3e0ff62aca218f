use clap::Parser;
use std::path::PathBuf;

use blobdl::DownloadOptions;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// URL of the blob to download
    #[arg(index = 1, required_unless_present = "status")]
    pub url: Option<String>,

    /// Destination file (defaults to the last URL path segment inside --download-dir)
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,

    /// Directory used when --output is not given
    #[arg(short = 'd', long = "download-dir", default_value = "downloads")]
    pub download_dir: PathBuf,

    /// JSON file with download options (camelCase keys); flags override it
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Block size in bytes (multiple of 1024)
    #[arg(short = 'b', long = "block-size")]
    pub block_size: Option<u64>,

    /// Number of blocks transferred simultaneously (1-15)
    #[arg(short = 's', long = "simultaneous")]
    pub simultaneous: Option<u32>,

    /// Verify the server checksum after the download
    #[arg(long)]
    pub verify: bool,

    /// Start over even if resume data exists
    #[arg(long = "ignore-resume")]
    pub ignore_resume: bool,

    /// Never read or write resume data
    #[arg(long = "no-resume")]
    pub no_resume: bool,

    /// Rate limit in bytes per second (e.g., 1048576 for 1MB/s)
    #[arg(short = 'r', long = "rate-limit")]
    pub rate_limit: Option<u32>,

    /// Print the saved progress of a partial download and exit
    #[arg(long, value_name = "DEST")]
    pub status: Option<PathBuf>,
}

impl Args {
    /// Options given on the command line; unset flags stay `None`.
    pub fn flag_options(&self) -> DownloadOptions {
        DownloadOptions {
            block_size: self.block_size,
            check_checksum_after_download: self.verify.then_some(true),
            ignore_resume_data: self.ignore_resume.then_some(true),
            simultaneous_downloads: self.simultaneous,
            enable_resumable_download: self.no_resume.then_some(false),
            max_bytes_per_second: self.rate_limit,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_map_to_options() {
        let args = Args::parse_from([
            "blobdl",
            "http://host/a.bin",
            "--verify",
            "-s",
            "8",
            "--no-resume",
        ]);
        let options = args.flag_options();
        assert_eq!(options.check_checksum_after_download, Some(true));
        assert_eq!(options.simultaneous_downloads, Some(8));
        assert_eq!(options.enable_resumable_download, Some(false));
        assert_eq!(options.ignore_resume_data, None);
        assert_eq!(options.block_size, None);
    }

    #[test]
    fn status_does_not_need_url() {
        let args = Args::parse_from(["blobdl", "--status", "downloads/a.bin"]);
        assert!(args.url.is_none());
        assert_eq!(args.status, Some(PathBuf::from("downloads/a.bin")));
    }
}
