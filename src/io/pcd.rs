//! PCD export of trajectories and feature maps.
//!
//! ASCII PCD v0.7 writers for the save-map service: `trajectory.pcd` keeps
//! the key index in `intensity`, `transformations.pcd` carries the full 6D
//! pose with the key time in `time`.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::core::se3;
use crate::core::types::{KeyPose, PointCloud3};
use crate::error::Result;

fn write_header(
    out: &mut impl Write,
    fields: &[(&str, usize)],
    points: usize,
) -> std::io::Result<()> {
    writeln!(out, "# .PCD v0.7 - Point Cloud Data file format")?;
    writeln!(out, "VERSION 0.7")?;
    let names: Vec<&str> = fields.iter().map(|(name, _)| *name).collect();
    writeln!(out, "FIELDS {}", names.join(" "))?;
    let sizes: Vec<String> = fields.iter().map(|(_, size)| size.to_string()).collect();
    writeln!(out, "SIZE {}", sizes.join(" "))?;
    writeln!(out, "TYPE {}", vec!["F"; fields.len()].join(" "))?;
    writeln!(out, "COUNT {}", vec!["1"; fields.len()].join(" "))?;
    writeln!(out, "WIDTH {points}")?;
    writeln!(out, "HEIGHT 1")?;
    writeln!(out, "VIEWPOINT 0 0 0 1 0 0 0")?;
    writeln!(out, "POINTS {points}")?;
    writeln!(out, "DATA ascii")
}

/// Write a plain `x y z` cloud.
pub fn write_cloud(path: &Path, cloud: &PointCloud3) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    write_header(&mut out, &[("x", 4), ("y", 4), ("z", 4)], cloud.len())?;
    for (x, y, z) in cloud.iter() {
        writeln!(out, "{x} {y} {z}")?;
    }
    out.flush()?;
    Ok(())
}

/// Write the 3D key-pose trajectory with the key index in `intensity`.
pub fn write_trajectory(path: &Path, key_poses: &[KeyPose]) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    write_header(
        &mut out,
        &[("x", 4), ("y", 4), ("z", 4), ("intensity", 4)],
        key_poses.len(),
    )?;
    for key_pose in key_poses {
        let t = key_pose.pose.translation.vector;
        writeln!(out, "{} {} {} {}", t.x, t.y, t.z, key_pose.index)?;
    }
    out.flush()?;
    Ok(())
}

/// Write the 6D key-pose trajectory with the key time in `time`.
pub fn write_transformations(path: &Path, key_poses: &[KeyPose]) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    write_header(
        &mut out,
        &[
            ("x", 4),
            ("y", 4),
            ("z", 4),
            ("intensity", 4),
            ("roll", 4),
            ("pitch", 4),
            ("yaw", 4),
            ("time", 8),
        ],
        key_poses.len(),
    )?;
    for key_pose in key_poses {
        let t = key_pose.pose.translation.vector;
        let (roll, pitch, yaw) = se3::rpy(&key_pose.pose);
        writeln!(
            out,
            "{} {} {} {} {roll} {pitch} {yaw} {}",
            t.x,
            t.y,
            t.z,
            key_pose.index,
            key_pose.timestamp_us as f64 * 1e-6
        )?;
    }
    out.flush()?;
    Ok(())
}

/// Voxel-grid downsample: one centroid per occupied `leaf_size` cell.
pub fn voxel_downsample(cloud: &PointCloud3, leaf_size: f64) -> PointCloud3 {
    use std::collections::HashMap;

    let inv = 1.0 / leaf_size as f32;
    let mut cells: HashMap<(i32, i32, i32), (f64, f64, f64, u32)> = HashMap::new();
    for (x, y, z) in cloud.iter() {
        let key = (
            (x * inv).floor() as i32,
            (y * inv).floor() as i32,
            (z * inv).floor() as i32,
        );
        let cell = cells.entry(key).or_insert((0.0, 0.0, 0.0, 0));
        cell.0 += x as f64;
        cell.1 += y as f64;
        cell.2 += z as f64;
        cell.3 += 1;
    }

    let mut keys: Vec<_> = cells.keys().copied().collect();
    keys.sort_unstable();
    let mut out = PointCloud3::with_capacity(keys.len());
    for key in keys {
        let (sx, sy, sz, count) = cells[&key];
        let n = count as f64;
        out.push((sx / n) as f32, (sy / n) as f32, (sz / n) as f32);
    }
    out
}
