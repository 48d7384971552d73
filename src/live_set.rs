//! In-memory live set served by the demo host.
//!
//! Tracks hold devices, devices hold parameters with a native range. Clients
//! address parameters by index and always exchange *normalized* values in
//! `[0, 1]`; the model maps them onto each parameter's range.

use tracing::warn;

use crate::host::{DispatchTable, HandlerError, ParamsExt};
use crate::types::{params, Params, Value};

pub const MIN_TEMPO: f64 = 20.0;
pub const MAX_TEMPO: f64 = 999.0;

#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub min: f64,
    pub max: f64,
    pub value: f64,
    pub quantized: bool,
}

impl Parameter {
    pub fn new(name: &str, min: f64, max: f64, value: f64) -> Self {
        Self {
            name: name.to_string(),
            min,
            max,
            value,
            quantized: false,
        }
    }

    pub fn toggle(name: &str, on: bool) -> Self {
        Self {
            quantized: true,
            ..Self::new(name, 0.0, 1.0, if on { 1.0 } else { 0.0 })
        }
    }

    pub fn normalized(&self) -> f64 {
        let span = self.max - self.min;
        if span == 0.0 {
            0.0
        } else {
            (self.value - self.min) / span
        }
    }

    /// Caller guarantees `v` is in `[0, 1]`.
    fn set_normalized(&mut self, v: f64) {
        let mut value = self.min + v * (self.max - self.min);
        if self.quantized {
            value = value.round();
        }
        self.value = value;
    }

    fn describe(&self, index: usize) -> Value {
        Value::Map(params! {
            "index" => index,
            "name" => self.name.as_str(),
            "value" => self.value,
            "normalized_value" => self.normalized(),
            "min" => self.min,
            "max" => self.max,
            "is_quantized" => self.quantized,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub name: String,
    pub parameters: Vec<Parameter>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub name: String,
    pub devices: Vec<Device>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LiveSet {
    pub tempo: f64,
    pub playing: bool,
    pub signature: (u32, u32),
    pub tracks: Vec<Track>,
}

impl LiveSet {
    /// Two tracks with one synth and one effect each.
    pub fn demo() -> Self {
        let synth = |name: &str| Device {
            name: name.to_string(),
            parameters: vec![
                Parameter::toggle("Device On", true),
                Parameter::new("Filter Freq", 20.0, 20_000.0, 1_000.0),
                Parameter::new("Filter Res", 0.0, 1.25, 0.2),
                Parameter::new("Volume", -36.0, 0.0, -6.0),
            ],
        };
        let filter = Device {
            name: "Auto Filter".to_string(),
            parameters: vec![
                Parameter::toggle("Device On", true),
                Parameter::new("Frequency", 20.0, 135.0, 100.0),
                Parameter::new("Resonance", 0.0, 1.25, 0.0),
            ],
        };

        Self {
            tempo: 120.0,
            playing: false,
            signature: (4, 4),
            tracks: vec![
                Track {
                    name: "Bass".to_string(),
                    devices: vec![synth("Operator"), filter.clone()],
                },
                Track {
                    name: "Pad".to_string(),
                    devices: vec![synth("Wavetable"), filter],
                },
            ],
        }
    }

    fn track(&self, index: i64) -> Result<&Track, HandlerError> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.tracks.get(i))
            .ok_or_else(|| {
                HandlerError::invalid(format!(
                    "track index {} out of range (0..{})",
                    index,
                    self.tracks.len()
                ))
            })
    }

    fn device(&self, track: i64, device: i64) -> Result<&Device, HandlerError> {
        let t = self.track(track)?;
        usize::try_from(device)
            .ok()
            .and_then(|i| t.devices.get(i))
            .ok_or_else(|| {
                HandlerError::invalid(format!(
                    "device index {} out of range (0..{})",
                    device,
                    t.devices.len()
                ))
            })
    }

    fn device_mut(&mut self, track: i64, device: i64) -> Result<&mut Device, HandlerError> {
        self.device(track, device)?;
        // Indices were validated above.
        Ok(&mut self.tracks[track as usize].devices[device as usize])
    }
}

fn check_normalized(index: i64, value: f64) -> Result<(), HandlerError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(HandlerError::invalid(format!(
            "value {} for parameter {} is outside [0, 1]",
            value, index
        )))
    }
}

fn parameter_mut(device: &mut Device, index: i64) -> Result<&mut Parameter, HandlerError> {
    let count = device.parameters.len();
    usize::try_from(index)
        .ok()
        .and_then(|i| device.parameters.get_mut(i))
        .ok_or_else(|| {
            HandlerError::invalid(format!(
                "parameter index {} out of range (0..{})",
                index, count
            ))
        })
}

fn echo(_: &mut LiveSet, p: &Params) -> Result<Params, HandlerError> {
    Ok(p.clone())
}

fn get_session_info(set: &mut LiveSet, _: &Params) -> Result<Params, HandlerError> {
    let tracks: Vec<Value> = set
        .tracks
        .iter()
        .enumerate()
        .map(|(i, t)| {
            Value::Map(params! {
                "index" => i,
                "name" => t.name.as_str(),
                "device_count" => t.devices.len(),
            })
        })
        .collect();
    Ok(params! {
        "tempo" => set.tempo,
        "is_playing" => set.playing,
        "signature_numerator" => set.signature.0 as i64,
        "signature_denominator" => set.signature.1 as i64,
        "track_count" => set.tracks.len(),
        "tracks" => tracks,
    })
}

fn get_track_info(set: &mut LiveSet, p: &Params) -> Result<Params, HandlerError> {
    let index = p.require_i64("track_index")?;
    let track = set.track(index)?;
    let devices: Vec<Value> = track
        .devices
        .iter()
        .enumerate()
        .map(|(i, d)| {
            Value::Map(params! {
                "index" => i,
                "name" => d.name.as_str(),
                "parameter_count" => d.parameters.len(),
            })
        })
        .collect();
    Ok(params! {
        "index" => index,
        "name" => track.name.as_str(),
        "device_count" => devices.len(),
        "devices" => devices,
    })
}

fn get_device_parameters(set: &mut LiveSet, p: &Params) -> Result<Params, HandlerError> {
    let track_index = p.require_i64("track_index")?;
    let device_index = p.require_i64("device_index")?;
    let track = set.track(track_index)?;
    let device = set.device(track_index, device_index)?;
    let parameters: Vec<Value> = device
        .parameters
        .iter()
        .enumerate()
        .map(|(i, param)| param.describe(i))
        .collect();
    Ok(params! {
        "track_name" => track.name.as_str(),
        "device_name" => device.name.as_str(),
        "parameters" => parameters,
    })
}

fn set_device_parameter(set: &mut LiveSet, p: &Params) -> Result<Params, HandlerError> {
    let track_index = p.require_i64("track_index")?;
    let device_index = p.require_i64("device_index")?;
    let index = p.require_i64("parameter_index")?;
    let value = p.require_f64("value")?;

    let device = set.device_mut(track_index, device_index)?;
    let param = parameter_mut(device, index)?;
    check_normalized(index, value)?;
    param.set_normalized(value);

    Ok(params! {
        "parameter_name" => param.name.as_str(),
        "value" => param.value,
        "normalized_value" => value,
    })
}

/// Entries with a bad index or value are skipped and logged; the rest apply.
fn batch_set_device_parameters(set: &mut LiveSet, p: &Params) -> Result<Params, HandlerError> {
    let track_index = p.require_i64("track_index")?;
    let device_index = p.require_i64("device_index")?;
    let indices = p.list_or_empty("parameter_indices")?;
    let values = p.list_or_empty("values")?;
    if indices.len() != values.len() {
        return Err(HandlerError::invalid(format!(
            "{} parameter indices but {} values",
            indices.len(),
            values.len()
        )));
    }

    let device = set.device_mut(track_index, device_index)?;
    let mut details = Vec::with_capacity(indices.len());
    for (index, value) in indices.iter().zip(values) {
        let (Some(index), Some(value)) = (index.as_i64(), value.as_f64()) else {
            warn!(?index, ?value, "batch entry is not an index/number pair, skipped");
            continue;
        };
        let applied = parameter_mut(device, index).and_then(|param| {
            check_normalized(index, value)?;
            param.set_normalized(value);
            Ok(param.name.clone())
        });
        match applied {
            Ok(name) => details.push(Value::Map(params! {
                "index" => index,
                "name" => name,
                "normalized_value" => value,
            })),
            Err(e) => warn!(error = %e, "batch entry skipped"),
        }
    }

    Ok(params! {
        "updated_parameters_count" => details.len(),
        "details" => details,
    })
}

fn set_tempo(set: &mut LiveSet, p: &Params) -> Result<Params, HandlerError> {
    let tempo = p.require_f64("tempo")?;
    if !(MIN_TEMPO..=MAX_TEMPO).contains(&tempo) {
        return Err(HandlerError::invalid(format!(
            "tempo {} outside {}..={}",
            tempo, MIN_TEMPO, MAX_TEMPO
        )));
    }
    set.tempo = tempo;
    Ok(params! { "tempo" => set.tempo })
}

fn start_playback(set: &mut LiveSet, _: &Params) -> Result<Params, HandlerError> {
    set.playing = true;
    Ok(params! { "playing" => true })
}

fn stop_playback(set: &mut LiveSet, _: &Params) -> Result<Params, HandlerError> {
    set.playing = false;
    Ok(params! { "playing" => false })
}

/// Every command the demo host answers, `ping` included.
pub fn command_table() -> DispatchTable<LiveSet> {
    DispatchTable::new()
        .with("echo", echo)
        .with("get_session_info", get_session_info)
        .with("get_track_info", get_track_info)
        .with("get_device_parameters", get_device_parameters)
        .with("set_device_parameter", set_device_parameter)
        .with("batch_set_device_parameters", batch_set_device_parameters)
        .with("set_tempo", set_tempo)
        .with("start_playback", start_playback)
        .with("stop_playback", stop_playback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::DispatchError;
    use crate::types::{Command, ErrorCode};

    fn run(set: &mut LiveSet, name: &str, p: Params) -> Result<Params, DispatchError> {
        command_table().dispatch(set, &Command::new(name, p))
    }

    fn code(err: DispatchError) -> ErrorCode {
        err.to_error_info().code
    }

    #[test]
    fn table_has_every_command() {
        let table = command_table();
        for name in [
            "ping",
            "echo",
            "get_session_info",
            "get_track_info",
            "get_device_parameters",
            "set_device_parameter",
            "batch_set_device_parameters",
            "set_tempo",
            "start_playback",
            "stop_playback",
        ] {
            assert!(table.contains(name), "{}", name);
        }
    }

    #[test]
    fn session_info_lists_tracks() {
        let mut set = LiveSet::demo();
        let info = run(&mut set, "get_session_info", Params::new()).unwrap();
        assert_eq!(info["track_count"], Value::Int(2));
        assert_eq!(info["tempo"], Value::Float(120.0));
        let tracks = info["tracks"].as_list().unwrap();
        assert_eq!(tracks[1].as_map().unwrap()["name"], Value::from("Pad"));
    }

    #[test]
    fn set_parameter_maps_onto_native_range() {
        let mut set = LiveSet::demo();
        let p = params! {
            "track_index" => 0, "device_index" => 0, "parameter_index" => 3, "value" => 0.5,
        };
        let r = run(&mut set, "set_device_parameter", p).unwrap();
        assert_eq!(r["parameter_name"], Value::from("Volume"));
        assert_eq!(set.tracks[0].devices[0].parameters[3].value, -18.0);
    }

    #[test]
    fn quantized_parameters_snap() {
        let mut set = LiveSet::demo();
        let p = params! {
            "track_index" => 1, "device_index" => 1, "parameter_index" => 0, "value" => 0.3,
        };
        run(&mut set, "set_device_parameter", p).unwrap();
        assert_eq!(set.tracks[1].devices[1].parameters[0].value, 0.0);
    }

    #[test]
    fn out_of_range_value_is_rejected() {
        let mut set = LiveSet::demo();
        let before = set.clone();
        let p = params! {
            "track_index" => 0, "device_index" => 0, "parameter_index" => 1, "value" => 1.5,
        };
        let err = run(&mut set, "set_device_parameter", p).unwrap_err();
        assert_eq!(code(err), ErrorCode::InvalidParams);
        assert_eq!(set, before);
    }

    #[test]
    fn bad_indices_are_invalid_params() {
        let mut set = LiveSet::demo();
        let err = run(&mut set, "get_track_info", params! { "track_index" => 7 }).unwrap_err();
        assert_eq!(code(err), ErrorCode::InvalidParams);

        let err = run(
            &mut set,
            "get_device_parameters",
            params! { "track_index" => 0, "device_index" => -1 },
        )
        .unwrap_err();
        assert_eq!(code(err), ErrorCode::InvalidParams);
    }

    #[test]
    fn batch_skips_invalid_entries() {
        let mut set = LiveSet::demo();
        let p = params! {
            "track_index" => 0,
            "device_index" => 1,
            "parameter_indices" => vec![1i64, 9, 2],
            "values" => vec![1.0, 0.5, 2.0],
        };
        let r = run(&mut set, "batch_set_device_parameters", p).unwrap();
        assert_eq!(r["updated_parameters_count"], Value::Int(1));
        assert_eq!(set.tracks[0].devices[1].parameters[1].value, 135.0);
        assert_eq!(set.tracks[0].devices[1].parameters[2].value, 0.0);
    }

    #[test]
    fn batch_length_mismatch_fails() {
        let mut set = LiveSet::demo();
        let p = params! {
            "track_index" => 0,
            "device_index" => 0,
            "parameter_indices" => vec![1i64, 2],
            "values" => vec![0.5],
        };
        let err = run(&mut set, "batch_set_device_parameters", p).unwrap_err();
        assert_eq!(code(err), ErrorCode::InvalidParams);
    }

    #[test]
    fn tempo_and_transport() {
        let mut set = LiveSet::demo();
        run(&mut set, "set_tempo", params! { "tempo" => 128.5 }).unwrap();
        assert_eq!(set.tempo, 128.5);
        assert!(run(&mut set, "set_tempo", params! { "tempo" => 5.0 }).is_err());

        run(&mut set, "start_playback", Params::new()).unwrap();
        assert!(set.playing);
        run(&mut set, "stop_playback", Params::new()).unwrap();
        assert!(!set.playing);
    }

    #[test]
    fn echo_returns_input() {
        let mut set = LiveSet::demo();
        let r = run(&mut set, "echo", params! { "value" => 42 }).unwrap();
        assert_eq!(r, params! { "value" => 42 });
    }
}
