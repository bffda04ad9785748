use std::fmt;
use std::fmt::{Display, Formatter};

// Injected by CI; local builds fall back to the crate version alone.
const BUILD_GIT_REVISION: Option<&str> = option_env!("TUNNELD_BUILD_GIT_REVISION");
const BUILD_STATUS: Option<&str> = option_env!("TUNNELD_BUILD_STATUS");

#[derive(serde::Serialize, Clone, Debug, Default)]
pub struct BuildInfo {
	pub version: String,
	pub git_revision: String,
	pub build_status: String,
	pub rust_version: String,
}

impl BuildInfo {
	pub fn new() -> Self {
		BuildInfo {
			version: env!("CARGO_PKG_VERSION").to_string(),
			git_revision: BUILD_GIT_REVISION.unwrap_or("unknown").to_string(),
			build_status: BUILD_STATUS.unwrap_or("unreleased").to_string(),
			rust_version: option_env!("TUNNELD_BUILD_RUSTC_VERSION")
				.unwrap_or("unknown")
				.to_string(),
		}
	}
}

impl Display for BuildInfo {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"version.BuildInfo{{Version:\"{}\", GitRevision:\"{}\", BuildStatus:\"{}\", RustVersion:\"{}\"}}",
			self.version, self.git_revision, self.build_status, self.rust_version
		)
	}
}
