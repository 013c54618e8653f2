//! Handler selection and the unpack lifecycle.

use crate::error::UnpackError;
use crate::handlers::{Handler, HandlerRegistry, Toolchain};
use crate::harvest::{harvest, DuplicateSet};
use crate::safety::unlock_tree;
use crate::jail::{Jail, JailStatus, ToolInvocation, ZipJail};
use crate::source::{ArchivePath, SourceFile};
use crate::types::{UnpackConfig, UnpackOutcome, UnpackStatus};
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// Picks a handler for a source and drives its tool through the jail.
///
/// Every call gets its own output directory and temporary archive copy, so
/// one `Unpacker` can serve unrelated requests as long as each session uses
/// its own [`DuplicateSet`].
pub struct Unpacker {
    config: UnpackConfig,
    registry: HandlerRegistry,
    tools: Toolchain,
    jail: Box<dyn Jail>,
}

impl Unpacker {
    /// Creates an unpacker running tools through `jail`.
    pub fn new(config: UnpackConfig, jail: Box<dyn Jail>) -> Self {
        let tools = Toolchain::discover(config.sevenzip.as_deref());
        Self {
            config,
            registry: HandlerRegistry::default(),
            tools,
            jail,
        }
    }

    /// Creates an unpacker backed by [`ZipJail`] configured from `config.jail`.
    pub fn with_zipjail(config: UnpackConfig) -> Self {
        let jail = ZipJail::new(config.jail.clone());
        Self::new(config, Box::new(jail))
    }

    /// Replaces the handler registry.
    pub fn with_registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Replaces the resolved tool locations.
    pub fn with_toolchain(mut self, tools: Toolchain) -> Self {
        self.tools = tools;
        self
    }

    /// Handlers in priority order.
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Resolved tool locations.
    pub fn toolchain(&self) -> &Toolchain {
        &self.tools
    }

    /// Active configuration.
    pub fn config(&self) -> &UnpackConfig {
        &self.config
    }

    /// Unpacks `source` with the first handler that claims it.
    ///
    /// # Arguments
    ///
    /// * `source` - The archive, on disk or in memory
    /// * `password` - Password to try; handlers substitute their default when absent
    /// * `duplicates` - Session-wide fingerprint set; `None` treats every entry as unique
    ///
    /// # Returns
    ///
    /// An [`UnpackOutcome`] whose status tells apart "no handler", "rejected
    /// by the jail", "tool failed", "output unreadable" and "extracted".
    ///
    /// # Errors
    ///
    /// Only when the on-disk source is missing or scratch space cannot be
    /// allocated. Nothing the archive itself causes is an error.
    pub fn unpack(
        &self,
        source: &SourceFile,
        password: Option<&str>,
        duplicates: Option<&mut DuplicateSet>,
    ) -> Result<UnpackOutcome, UnpackError> {
        if let Some(path) = source.filepath() {
            if !path.exists() {
                return Err(UnpackError::NotFound(path.to_path_buf()));
            }
        }

        let Some(handler) = self.registry.select(source, &self.tools) else {
            debug!(source = ?source.filename(), "no handler claims source");
            return Ok(UnpackOutcome::failed(UnpackStatus::NoHandler));
        };

        self.unpack_with(handler, source, password, duplicates)
    }

    /// Unpacks `source` with a specific handler.
    pub fn unpack_with(
        &self,
        handler: &dyn Handler,
        source: &SourceFile,
        password: Option<&str>,
        duplicates: Option<&mut DuplicateSet>,
    ) -> Result<UnpackOutcome, UnpackError> {
        let Some(program) = self.tools.resolve(handler.tool()) else {
            return Ok(UnpackOutcome::failed(UnpackStatus::ToolFailed {
                handler: handler.name().to_string(),
                exit_code: None,
                message: format!("{:?} is not available on this host", handler.tool()),
            }));
        };

        let output_dir = self.allocate_output_dir()?;

        let archive = match source.filepath() {
            Some(path) => ArchivePath::Existing(path),
            None => ArchivePath::Temporary(
                source
                    .temp_path(handler.temp_suffix(), self.config.work_dir.as_deref())
                    .map_err(UnpackError::TempAllocation)?,
            ),
        };

        let password = password
            .filter(|p| !p.is_empty())
            .or(handler.default_password());

        let invocation = ToolInvocation {
            program: program.to_path_buf(),
            args: handler.extract_args(password, output_dir.path(), archive.path()),
        };

        info!(
            handler = handler.name(),
            archive = ?archive.path(),
            temporary = archive.is_temporary(),
            password_length = password.map(str::len),
            "unpacking archive"
        );

        let result = self.jail.run(archive.path(), output_dir.path(), &invocation);

        // The temporary copy goes away whatever the jail reported
        drop(archive);

        match result.status {
            JailStatus::Completed => {}
            JailStatus::Rejected(violation) => {
                warn!(
                    security_event = true,
                    handler = handler.name(),
                    source = ?source.filename(),
                    %violation,
                    "jail rejected archive"
                );
                discard(output_dir);
                return Ok(UnpackOutcome::failed(UnpackStatus::Rejected {
                    handler: handler.name().to_string(),
                    violation,
                }));
            }
            JailStatus::ToolFailed { exit_code, message } => {
                info!(
                    handler = handler.name(),
                    source = ?source.filename(),
                    ?exit_code,
                    %message,
                    "extraction tool failed"
                );
                discard(output_dir);
                return Ok(UnpackOutcome::failed(UnpackStatus::ToolFailed {
                    handler: handler.name().to_string(),
                    exit_code,
                    message,
                }));
            }
        }

        // Tools may leave unreadable modes behind; harvest and removal need access
        let harvested = unlock_tree(output_dir.path())
            .and_then(|()| harvest(output_dir.path(), handler, duplicates));
        let mut entries = match harvested {
            Ok(entries) => entries,
            Err(e) => {
                warn!(
                    handler = handler.name(),
                    source = ?source.filename(),
                    error = %e,
                    "unable to read tool output"
                );
                discard(output_dir);
                return Ok(UnpackOutcome::failed(UnpackStatus::HarvestFailed {
                    handler: handler.name().to_string(),
                    message: e.to_string(),
                }));
            }
        };
        for entry in &mut entries {
            entry.nested_format = self
                .registry
                .identify(&entry.to_source())
                .map(|nested| nested.name().to_string());
        }

        info!(
            handler = handler.name(),
            entries = entries.len(),
            duplicates = entries.iter().filter(|e| e.is_duplicate).count(),
            "archive unpacked"
        );

        Ok(UnpackOutcome::extracted(handler.name(), entries, output_dir))
    }

    /// Unpacks `source` and, depth-first, every non-duplicate entry that is
    /// itself an archive, up to `max_depth` levels below it.
    ///
    /// Nested results are attached to [`crate::ExtractedEntry::children`].
    pub fn unpack_recursive(
        &self,
        source: &SourceFile,
        password: Option<&str>,
        duplicates: Option<&mut DuplicateSet>,
    ) -> Result<UnpackOutcome, UnpackError> {
        self.descend(source, password, duplicates, 0)
    }

    fn descend(
        &self,
        source: &SourceFile,
        password: Option<&str>,
        mut duplicates: Option<&mut DuplicateSet>,
        depth: usize,
    ) -> Result<UnpackOutcome, UnpackError> {
        let mut outcome = self.unpack(source, password, duplicates.as_deref_mut())?;

        for entry in &mut outcome.entries {
            if entry.is_duplicate || entry.nested_format.is_none() {
                continue;
            }
            if depth >= self.config.max_depth {
                warn!(path = ?entry.relative_path, depth, "maximum nesting depth reached");
                continue;
            }

            let child = self.descend(&entry.to_source(), password, duplicates.as_deref_mut(), depth + 1)?;
            entry.children = Some(Box::new(child));
        }

        Ok(outcome)
    }

    fn allocate_output_dir(&self) -> Result<TempDir, UnpackError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("unpack-out-");
        let dir = match &self.config.work_dir {
            Some(work_dir) => builder.tempdir_in(work_dir),
            None => builder.tempdir(),
        };
        dir.map_err(UnpackError::TempAllocation)
    }
}

/// Removes an output directory that will not be handed out.
fn discard(output_dir: TempDir) {
    let path = output_dir.path().to_path_buf();
    if let Err(e) = unlock_tree(&path) {
        debug!(?path, error = %e, "unable to restore output permissions");
    }
    if let Err(e) = output_dir.close() {
        warn!(?path, error = %e, "failed to remove output directory");
    }
}

impl std::fmt::Debug for Unpacker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unpacker")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("tools", &self.tools)
            .finish_non_exhaustive()
    }
}
