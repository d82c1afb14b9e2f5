//! Template expansion passes.
//!
//! Run once when a Play moves from `Init` to `Running`, and persisted together
//! with the phase change:
//!
//! 1. [`assign_frame_ids`] gives every frame without an id a random one
//! 2. [`expand_copies`] fans a frame with `copies = N > 1` into N siblings
//! 3. [`inject_vars_config`] mounts the resolved vars config object and binds
//!    its keys as environment variables
//! 4. [`inject_provisioned_volumes`] points volume references at the concrete
//!    provisioned volumes
//!
//! Every pass is idempotent: running [`expand_play`] twice yields the same spec.

use std::collections::{BTreeMap, HashSet};

use crate::ids;
use crate::types::{
    ClaimSource, EnvFromSource, EnvVar, Frame, LocalObjectReference, Play, PlaySpec, Volume,
    VolumeMount, VolumeSource,
};

/// Environment variable carrying a copy's zero-based index.
pub const FRAME_COPY_INDEX_VAR: &str = "FRAME_COPY_INDEX";
/// Volume name used for the vars config object.
pub const VARS_VOLUME_NAME: &str = "scenerun-vars";
/// Mount path of the vars config object inside every container.
pub const VARS_MOUNT_PATH: &str = "/scenerun/vars";

/// Runs every pass against the Play's own status.
pub fn expand_play(play: &mut Play) {
    assign_frame_ids(&mut play.spec);
    expand_copies(&mut play.spec);
    if !play.status.vars_config_map.is_empty() {
        let config_name = play.status.vars_config_map.clone();
        inject_vars_config(&mut play.spec, &config_name);
    }
    inject_provisioned_volumes(&mut play.spec, &play.status.provisioned_volumes);
}

/// Assigns random ids to frames that have none. Returns how many were assigned.
///
/// Existing ids are never changed: once a frame has an id it keeps it for the
/// lifetime of the Play.
pub fn assign_frame_ids(spec: &mut PlaySpec) -> usize {
    let frames = spec
        .screenplays
        .iter_mut()
        .flat_map(|s| s.scenes.iter_mut())
        .flat_map(|scene| scene.frames.iter_mut());

    let mut taken = HashSet::new();
    let mut missing = Vec::new();
    for frame in frames {
        if frame.id.is_empty() {
            missing.push(frame);
        } else {
            taken.insert(frame.id.clone());
        }
    }

    let fresh = ids::random_ids(missing.len(), &taken);
    let assigned = missing.len();
    for (frame, id) in missing.into_iter().zip(fresh) {
        frame.id = id;
    }
    assigned
}

/// Id of clone `index` of the frame with id `id`.
pub fn copy_id(id: &str, index: u32) -> String {
    format!("{}-{}", id, index)
}

/// Ids a frame occupies once its copies are fanned out. Empty for a frame
/// that has no id yet.
pub fn expanded_ids(frame: &Frame) -> Vec<String> {
    if frame.id.is_empty() {
        Vec::new()
    } else if frame.copies <= 1 {
        vec![frame.id.clone()]
    } else {
        (0..frame.copies).map(|i| copy_id(&frame.id, i)).collect()
    }
}

/// Replaces every frame with `copies > 1` by that many clones.
///
/// Clone `i` gets `-{i}` appended to its id and name, and
/// `FRAME_COPY_INDEX={i}` in the environment of each of its containers.
/// Clones carry `copies = 1`, so a second run leaves them alone.
pub fn expand_copies(spec: &mut PlaySpec) {
    for scene in spec
        .screenplays
        .iter_mut()
        .flat_map(|s| s.scenes.iter_mut())
    {
        if scene.frames.iter().all(|f| f.copies <= 1) {
            continue;
        }

        let mut frames = Vec::with_capacity(scene.frames.len());
        for frame in scene.frames.drain(..) {
            if frame.copies <= 1 {
                frames.push(frame);
                continue;
            }
            for index in 0..frame.copies {
                let mut copy = frame.clone();
                copy.copies = 1;
                if !copy.id.is_empty() {
                    copy.id = copy_id(&frame.id, index);
                }
                copy.name = format!("{}-{}", frame.name, index);
                for container in copy.action.containers.iter_mut() {
                    container.env.retain(|e| e.name != FRAME_COPY_INDEX_VAR);
                    container
                        .env
                        .push(EnvVar::new(FRAME_COPY_INDEX_VAR, index.to_string()));
                }
                frames.push(copy);
            }
        }
        scene.frames = frames;
    }
}

/// Mounts the vars config object into every frame and binds its keys as
/// environment variables of every container, init containers included.
pub fn inject_vars_config(spec: &mut PlaySpec, config_name: &str) {
    let frames = spec
        .screenplays
        .iter_mut()
        .flat_map(|s| s.scenes.iter_mut())
        .flat_map(|scene| scene.frames.iter_mut());

    for frame in frames {
        let action = &mut frame.action;
        let source = VolumeSource::ConfigMap(LocalObjectReference {
            name: config_name.to_string(),
        });
        match action.volumes.iter_mut().find(|v| v.name == VARS_VOLUME_NAME) {
            Some(volume) => volume.source = source,
            None => action.volumes.push(Volume {
                name: VARS_VOLUME_NAME.to_string(),
                source,
            }),
        }

        for container in action.all_containers_mut() {
            let already_bound = container
                .env_from
                .iter()
                .any(|e| e.config_map_ref.name == config_name);
            if !already_bound {
                container.env_from.push(EnvFromSource {
                    config_map_ref: LocalObjectReference {
                        name: config_name.to_string(),
                    },
                });
            }
            if !container
                .volume_mounts
                .iter()
                .any(|m| m.name == VARS_VOLUME_NAME)
            {
                container.volume_mounts.push(VolumeMount {
                    name: VARS_VOLUME_NAME.to_string(),
                    mount_path: VARS_MOUNT_PATH.to_string(),
                });
            }
        }
    }
}

/// Rewrites volume references to the provisioned volumes.
///
/// `volumes` maps a volume claim template name to the concrete volume that was
/// provisioned for it. Frames whose containers mount a volume with the
/// template's name get a frame volume of that name pointing at the claim; an
/// existing frame volume of that name is rewritten in place.
pub fn inject_provisioned_volumes(spec: &mut PlaySpec, volumes: &BTreeMap<String, String>) {
    if volumes.is_empty() {
        return;
    }
    let frames = spec
        .screenplays
        .iter_mut()
        .flat_map(|s| s.scenes.iter_mut())
        .flat_map(|scene| scene.frames.iter_mut());

    for frame in frames {
        for (template, claim) in volumes {
            if !frame.action.mounts(template) {
                continue;
            }
            let source = VolumeSource::PersistentVolumeClaim(ClaimSource {
                claim_name: claim.clone(),
            });
            match frame.action.volumes.iter_mut().find(|v| &v.name == template) {
                Some(volume) => volume.source = source,
                None => frame.action.volumes.push(Volume {
                    name: template.clone(),
                    source,
                }),
            }
        }
    }
}
