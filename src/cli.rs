use clap::Parser;

/// Monitor CI pipelines associated to a specific commit of a git repository.
#[derive(Parser)]
#[command(name = "cimon")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Repository to work with: either a path to a local git repository or
    /// the URL of an online repository. Defaults to the current directory.
    #[arg(short = 'r', long = "repository", value_name = "REPOSITORY")]
    pub repository: Option<String>,

    /// Commit to monitor: a SHA, tag or branch name. Defaults to HEAD.
    #[arg(value_name = "COMMIT")]
    pub commit: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["cimon"]);
        assert!(cli.repository.is_none());
        assert!(cli.commit.is_none());
    }

    #[test]
    fn test_repository_and_commit() {
        let cli = Cli::parse_from(["cimon", "-r", "github.com/owner/repo", "deadbeef"]);
        assert_eq!(cli.repository.as_deref(), Some("github.com/owner/repo"));
        assert_eq!(cli.commit.as_deref(), Some("deadbeef"));

        let cli = Cli::parse_from(["cimon", "--repository", "/tmp/repo"]);
        assert_eq!(cli.repository.as_deref(), Some("/tmp/repo"));
    }
}
