use reabridge::host::HostCallError;
use serde_json::{json, Value};

use crate::{Marker, World, CLOSE_PROJECT_TAB, NEW_PROJECT_TAB, PPQ};

/// Every native function the simulated host answers, sorted.
pub const NATIVES: &[&str] = &[
    "AddProjectMarker",
    "CountMediaItems",
    "CountProjectMarkers",
    "EnumProjects",
    "GetActiveTake",
    "GetAppVersion",
    "GetCursorPosition",
    "GetCursorPositionEx",
    "GetProjectTimeSignature2",
    "GetSelectedMediaItem",
    "MIDI_GetPPQPosFromProjTime",
    "Main_OnCommand",
    "SetCurrentBPM",
    "SetEditCurPos2",
    "ShowConsoleMsg",
    "ValidatePtr2",
];

pub(crate) fn call(world: &mut World, name: &str, args: &[Value]) -> Result<Value, HostCallError> {
    let args = Reader { name, args };
    match name {
        "AddProjectMarker" => {
            let project = args.str(0)?;
            let position = args.f64(2)?;
            let marker_name = args.str(4).unwrap_or_default().to_string();
            let wanted = args.i64(5).unwrap_or(-1);
            let markers = &mut args.project_mut(world, project)?.markers;
            let index = if wanted >= 0 {
                wanted
            } else {
                markers.iter().map(|marker| marker.index).max().unwrap_or(0) + 1
            };
            markers.push(Marker {
                index,
                position,
                name: marker_name,
            });
            Ok(json!(index))
        }
        "CountMediaItems" => {
            let project = args.str(0)?;
            Ok(json!(args.project(world, project)?.items.len()))
        }
        "CountProjectMarkers" => {
            let project = args.str(0)?;
            let count = args.project(world, project)?.markers.len();
            Ok(json!([count, count, 0]))
        }
        "EnumProjects" => {
            let index = args.i64(0)?;
            let handle = if index < 0 {
                world.current_project().map(|project| project.handle.clone())
            } else {
                usize::try_from(index)
                    .ok()
                    .and_then(|index| world.projects.get(index))
                    .map(|project| project.handle.clone())
            };
            Ok(handle.map(Value::String).unwrap_or(Value::Null))
        }
        "GetActiveTake" => {
            let item = args.str(0)?;
            Ok(world
                .active_take(item)
                .map(|take| json!(take))
                .unwrap_or(Value::Null))
        }
        "GetAppVersion" => Ok(json!("7.0/sim")),
        "GetCursorPosition" => Ok(json!(world
            .current_project()
            .map(|project| project.cursor)
            .unwrap_or_default())),
        "GetCursorPositionEx" => {
            let project = args.str(0)?;
            Ok(json!(args.project(world, project)?.cursor))
        }
        "GetProjectTimeSignature2" => {
            let project = args.str(0)?;
            Ok(json!([args.project(world, project)?.bpm, 4.0]))
        }
        "GetSelectedMediaItem" => {
            let project = args.str(0)?;
            let index = usize::try_from(args.i64(1)?).unwrap_or(usize::MAX);
            Ok(args
                .project(world, project)?
                .items
                .iter()
                .filter(|item| item.selected)
                .nth(index)
                .map(|item| json!(item.handle))
                .unwrap_or(Value::Null))
        }
        "MIDI_GetPPQPosFromProjTime" => {
            let take = args.str(0)?;
            let time = args.f64(1)?;
            let owner = world.take_owner(take).ok_or_else(|| args.failed("invalid take"))?;
            Ok(json!(time * owner.bpm / 60.0 * PPQ))
        }
        "Main_OnCommand" => {
            match args.i64(0)? {
                CLOSE_PROJECT_TAB => world.close_current(),
                NEW_PROJECT_TAB => {
                    world.open_project();
                }
                _ => {}
            }
            Ok(Value::Null)
        }
        "SetCurrentBPM" => {
            let project = args.str(0)?;
            let bpm = args.f64(1)?;
            args.project_mut(world, project)?.bpm = bpm;
            Ok(Value::Null)
        }
        "SetEditCurPos2" => {
            let project = args.str(0)?;
            let time = args.f64(1)?;
            args.project_mut(world, project)?.cursor = time.max(0.0);
            Ok(Value::Null)
        }
        "ShowConsoleMsg" => {
            world.console.push_str(args.str(0)?);
            Ok(Value::Null)
        }
        "ValidatePtr2" => {
            let handle = args.str(1)?;
            let valid = match args.str(2)? {
                "ReaProject*" => world.project(handle).is_some(),
                "MediaItem*" => world.has_item(handle),
                "MediaItem_Take*" => world.take_owner(handle).is_some(),
                _ => false,
            };
            Ok(json!(valid))
        }
        _ => Err(HostCallError::UnknownFunction {
            name: name.to_string(),
        }),
    }
}

struct Reader<'a> {
    name: &'a str,
    args: &'a [Value],
}

impl<'a> Reader<'a> {
    fn get(&self, index: usize) -> Result<&'a Value, HostCallError> {
        self.args
            .get(index)
            .ok_or_else(|| self.bad(format!("missing argument {}", index + 1)))
    }

    fn str(&self, index: usize) -> Result<&'a str, HostCallError> {
        self.get(index)?
            .as_str()
            .ok_or_else(|| self.bad(format!("argument {} must be a string", index + 1)))
    }

    fn f64(&self, index: usize) -> Result<f64, HostCallError> {
        self.get(index)?
            .as_f64()
            .ok_or_else(|| self.bad(format!("argument {} must be a number", index + 1)))
    }

    fn i64(&self, index: usize) -> Result<i64, HostCallError> {
        let value = self.get(index)?;
        value
            .as_i64()
            .or_else(|| value.as_f64().map(|number| number as i64))
            .ok_or_else(|| self.bad(format!("argument {} must be an integer", index + 1)))
    }

    fn project<'w>(
        &self,
        world: &'w World,
        handle: &str,
    ) -> Result<&'w crate::Project, HostCallError> {
        world
            .project(handle)
            .ok_or_else(|| self.failed("invalid project"))
    }

    fn project_mut<'w>(
        &self,
        world: &'w mut World,
        handle: &str,
    ) -> Result<&'w mut crate::Project, HostCallError> {
        world
            .project_mut(handle)
            .ok_or_else(|| self.failed("invalid project"))
    }

    fn bad(&self, message: String) -> HostCallError {
        HostCallError::BadArguments {
            name: self.name.to_string(),
            message,
        }
    }

    fn failed(&self, message: &str) -> HostCallError {
        HostCallError::Failed {
            name: self.name.to_string(),
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn world() -> (World, String) {
        let mut world = World::default();
        let project = world.open_project();
        (world, project)
    }

    #[test]
    fn names_are_sorted_and_unique() {
        let mut sorted = NATIVES.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted, NATIVES);
    }

    #[test]
    fn tempo_round_trips_through_the_time_signature() {
        let (mut world, project) = world();
        call(&mut world, "SetCurrentBPM", &[json!(project), json!(90.0), json!(true)]).unwrap();
        let signature = call(&mut world, "GetProjectTimeSignature2", &[json!(project)]).unwrap();
        assert_eq!(signature, json!([90.0, 4.0]));
    }

    #[test]
    fn markers_get_consecutive_indices() {
        let (mut world, project) = world();
        let marker = |world: &mut World, position: f64| {
            call(
                world,
                "AddProjectMarker",
                &[
                    json!(project),
                    json!(false),
                    json!(position),
                    json!(0.0),
                    json!("m"),
                    json!(-1),
                    json!(0),
                ],
            )
            .unwrap()
        };
        assert_eq!(marker(&mut world, 1.0), json!(1));
        assert_eq!(marker(&mut world, 2.0), json!(2));
        let counts = call(&mut world, "CountProjectMarkers", &[json!(project)]).unwrap();
        assert_eq!(counts, json!([2, 2, 0]));
    }

    #[test]
    fn ppq_follows_the_owning_project_tempo() {
        let (mut world, project) = world();
        let take = world.pointer("MediaItem_Take*");
        let item = world.pointer("MediaItem*");
        world.project_mut(&project).unwrap().items.push(crate::Item {
            handle: item,
            take: take.clone(),
            selected: true,
        });
        let ppq =
            call(&mut world, "MIDI_GetPPQPosFromProjTime", &[json!(take), json!(1.5)]).unwrap();
        assert_eq!(ppq, json!(1440.0));
    }

    #[test]
    fn stale_pointers_fail_validation() {
        let (mut world, project) = world();
        let validate = |world: &mut World| {
            call(world, "ValidatePtr2", &[json!(0), json!(project), json!("ReaProject*")]).unwrap()
        };
        assert_eq!(validate(&mut world), json!(true));
        call(&mut world, "Main_OnCommand", &[json!(CLOSE_PROJECT_TAB), json!(0)]).unwrap();
        assert_eq!(validate(&mut world), json!(false));
    }

    #[test]
    fn bad_arguments_and_unknown_names() {
        let (mut world, _) = world();
        assert!(matches!(
            call(&mut world, "SetCurrentBPM", &[json!(1)]),
            Err(HostCallError::BadArguments { .. })
        ));
        assert!(matches!(
            call(&mut world, "NonExistentApi", &[]),
            Err(HostCallError::UnknownFunction { .. })
        ));
    }
}
