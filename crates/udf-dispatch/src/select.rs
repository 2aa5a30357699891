//! Strategy selection. Everything here is pure: no I/O, no credentials.

use std::fmt;
use udf_core::{DispatchError, DispatchKey, Engine, Mode, Shape, Source};
use udf_sandbox::TileXyz;

use crate::warn;

pub const PARTIAL_COORDINATES_IGNORED: &str =
    "x, y, z arguments will be ignored because one of them is None";
pub const COORDINATES_IGNORED_FOR_FILE: &str =
    "x, y, z specified but UDF type is not 'tile', so they will be ignored";

/// A concrete call strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyId {
    SavedTile,
    SavedFile,
    SharedTile,
    SharedFile,
    StepRealtimeTile,
    StepRealtimeFile,
    StepLocalTile,
    StepLocalFile,
    StepBatch,
}

impl StrategyId {
    pub fn is_remote(self) -> bool {
        !matches!(self, StrategyId::StepLocalTile | StrategyId::StepLocalFile)
    }
}

impl fmt::Display for StrategyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StrategyId::SavedTile => "saved_tile",
            StrategyId::SavedFile => "saved_file",
            StrategyId::SharedTile => "shared_tile",
            StrategyId::SharedFile => "shared_file",
            StrategyId::StepRealtimeTile => "step_realtime_tile",
            StrategyId::StepRealtimeFile => "step_realtime_file",
            StrategyId::StepLocalTile => "step_local_tile",
            StrategyId::StepLocalFile => "step_local_file",
            StrategyId::StepBatch => "step_batch",
        };
        f.write_str(s)
    }
}

/// The dispatch table.
///
/// Saved and token sources only run on the realtime engine. In-memory definitions run on
/// realtime or locally in either mode; the batch engine only accepts synchronous file calls.
pub fn select_strategy(key: DispatchKey) -> Result<StrategyId, DispatchError> {
    use StrategyId::*;

    match (key.mode, key.shape, key.source, key.engine) {
        (_, Shape::Tile, Source::Saved, Engine::Realtime) => Ok(SavedTile),
        (_, Shape::File, Source::Saved, Engine::Realtime) => Ok(SavedFile),
        (_, Shape::Tile, Source::Token, Engine::Realtime) => Ok(SharedTile),
        (_, Shape::File, Source::Token, Engine::Realtime) => Ok(SharedFile),
        (_, Shape::Tile, Source::Local, Engine::Realtime) => Ok(StepRealtimeTile),
        (_, Shape::File, Source::Local, Engine::Realtime) => Ok(StepRealtimeFile),
        (_, Shape::Tile, Source::Local, Engine::Local) => Ok(StepLocalTile),
        (_, Shape::File, Source::Local, Engine::Local) => Ok(StepLocalFile),
        (Mode::Sync, Shape::Tile, Source::Local, Engine::Batch) => {
            Err(DispatchError::NotImplemented(key))
        }
        (Mode::Sync, Shape::File, Source::Local, Engine::Batch) => Ok(StepBatch),
        (_, _, Source::Token, _) => Err(DispatchError::TokenRequiresRealtime),
        (_, _, Source::Saved, _) => Err(DispatchError::SavedRequiresRealtime),
        _ => Err(DispatchError::Unregistered(key)),
    }
}

/// Decide between tile and file from the coordinates and the requested shape.
///
/// Returns the tile to run against when the shape is `tile`.
pub fn resolve_shape(
    x: Option<u32>,
    y: Option<u32>,
    z: Option<u32>,
    requested: Option<Shape>,
    warnings: &mut Vec<String>,
) -> Result<(Shape, Option<TileXyz>), DispatchError> {
    if let (Some(x), Some(y), Some(z)) = (x, y, z) {
        return match requested.unwrap_or(Shape::Tile) {
            Shape::Tile => Ok((Shape::Tile, Some(TileXyz::new(x, y, z)))),
            Shape::File => {
                warn(warnings, COORDINATES_IGNORED_FOR_FILE);
                Ok((Shape::File, None))
            }
        };
    }

    if requested == Some(Shape::Tile) {
        return Err(DispatchError::MissingCoordinates);
    }
    if x.is_some() || y.is_some() || z.is_some() {
        warn(warnings, PARTIAL_COORDINATES_IGNORED);
    }
    Ok((Shape::File, None))
}

/// Engine used when the caller names none.
pub fn default_engine(
    source: Source,
    configured_default: Option<Engine>,
    credentials_configured: bool,
) -> Engine {
    match (source, configured_default) {
        (Source::Saved | Source::Token, _) => Engine::Realtime,
        (Source::Local, Some(engine)) => engine,
        (Source::Local, None) if credentials_configured => Engine::Realtime,
        (Source::Local, None) => Engine::Local,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(mode: Mode, shape: Shape, source: Source, engine: Engine) -> DispatchKey {
        DispatchKey::new(mode, shape, source, engine)
    }

    #[test]
    fn every_key_is_either_a_strategy_or_an_error() {
        let mut registered = 0;
        for k in DispatchKey::all() {
            match select_strategy(k) {
                Ok(strategy) => {
                    registered += 1;
                    if k.source != Source::Local {
                        assert_eq!(k.engine, Engine::Realtime, "{k} -> {strategy}");
                    }
                }
                Err(DispatchError::NotImplemented(nk)) => assert_eq!(nk, k),
                Err(DispatchError::TokenRequiresRealtime) => assert_eq!(k.source, Source::Token),
                Err(DispatchError::SavedRequiresRealtime) => assert_eq!(k.source, Source::Saved),
                Err(DispatchError::Unregistered(uk)) => assert_eq!(uk, k),
                Err(other) => panic!("unexpected error for {k}: {other}"),
            }
        }
        // 4 saved + 4 token + 8 local + 1 batch
        assert_eq!(registered, 17);
    }

    #[test]
    fn batch_is_sync_file_only() {
        assert_eq!(
            select_strategy(key(Mode::Sync, Shape::File, Source::Local, Engine::Batch)).unwrap(),
            StrategyId::StepBatch
        );
        let err =
            select_strategy(key(Mode::Sync, Shape::Tile, Source::Local, Engine::Batch)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Call type is not yet implemented: (sync, tile, local, batch)"
        );
        let err =
            select_strategy(key(Mode::Async, Shape::File, Source::Local, Engine::Batch)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Could not determine how to call with settings: (async, file, local, batch)"
        );
    }

    #[test]
    fn remote_sources_need_realtime() {
        let err =
            select_strategy(key(Mode::Sync, Shape::File, Source::Token, Engine::Local)).unwrap_err();
        assert_eq!(err.to_string(), "UDF tokens can only be called on the realtime engine.");
        let err =
            select_strategy(key(Mode::Async, Shape::Tile, Source::Saved, Engine::Batch)).unwrap_err();
        assert!(err.to_string().starts_with("Saved UDFs can only be called"));
    }

    #[test]
    fn full_coordinates_mean_tile() {
        let mut warnings = Vec::new();
        let (shape, tile) = resolve_shape(Some(1), Some(2), Some(3), None, &mut warnings).unwrap();
        assert_eq!(shape, Shape::Tile);
        assert_eq!(tile, Some(TileXyz::new(1, 2, 3)));
        assert!(warnings.is_empty());
    }

    #[test]
    fn partial_coordinates_are_ignored_with_warning() {
        let mut warnings = Vec::new();
        let (shape, tile) = resolve_shape(Some(1), None, Some(3), None, &mut warnings).unwrap();
        assert_eq!(shape, Shape::File);
        assert_eq!(tile, None);
        assert_eq!(warnings, [PARTIAL_COORDINATES_IGNORED]);
    }

    #[test]
    fn explicit_shape_conflicts() {
        let mut warnings = Vec::new();
        let (shape, _) =
            resolve_shape(Some(1), Some(2), Some(3), Some(Shape::File), &mut warnings).unwrap();
        assert_eq!(shape, Shape::File);
        assert_eq!(warnings, [COORDINATES_IGNORED_FOR_FILE]);

        let err = resolve_shape(None, None, None, Some(Shape::Tile), &mut warnings).unwrap_err();
        assert!(matches!(err, DispatchError::MissingCoordinates));
    }

    #[test]
    fn engine_defaults() {
        assert_eq!(default_engine(Source::Token, Some(Engine::Local), false), Engine::Realtime);
        assert_eq!(default_engine(Source::Local, None, true), Engine::Realtime);
        assert_eq!(default_engine(Source::Local, None, false), Engine::Local);
        assert_eq!(default_engine(Source::Local, Some(Engine::Batch), true), Engine::Batch);
    }
}
