//! Combination parameters: the immutable run description sent from the
//! manager to every worker once per run.

use crate::combi_error::CombiError;
use crate::comm::wire::{WireReader, WireWriter, WIRE_VERSION};
use crate::element::ElementKind;
use crate::scheme::{dominates, LevelType, LevelVector};
use crate::task::TaskId;

/// Connection parameters of the third-level relay.
#[derive(Clone, Debug, PartialEq)]
pub struct ThirdLevelConfig {
    pub host: String,
    pub port: u16,
    /// Which of the two participating systems this one is.
    pub system_number: usize,
}

/// Immutable after installation via `UPDATE_COMBI_PARAMETERS`.
#[derive(Clone, Debug, PartialEq)]
pub struct CombiParameters {
    pub dim: usize,
    pub lmin: LevelVector,
    pub lmax: LevelVector,
    pub boundary: Vec<bool>,
    /// This system's share of the scheme.
    pub levels: Vec<LevelVector>,
    pub coeffs: Vec<f64>,
    pub task_ids: Vec<TaskId>,
    /// Number of combination steps in the run.
    pub ncombi: usize,
    /// Grids per task (application fields).
    pub num_grids: usize,
    /// Processor grid of every component grid.
    pub parallelization: Vec<usize>,
    /// Subtracted from `lmin` for the sparse grid reference box (clamped).
    pub reduce_lmin: Vec<LevelType>,
    /// Subtracted from `lmax` for the sparse grid reference box (clamped).
    pub reduce_lmax: Vec<LevelType>,
    pub element_kind: ElementKind,
    pub third_level: Option<ThirdLevelConfig>,
    /// Static task assignment: group index per task, aligned with
    /// `task_ids`. Empty for manager-driven dispatch.
    pub group_assignment: Vec<usize>,
}

impl CombiParameters {
    /// Basic consistency; called on construction and after decode.
    pub fn validate(&self) -> Result<(), CombiError> {
        if self.dim == 0
            || self.lmin.len() != self.dim
            || self.lmax.len() != self.dim
            || self.boundary.len() != self.dim
            || self.parallelization.len() != self.dim
        {
            return Err(CombiError::InvalidScheme(
                "combi parameter dimensions disagree".into(),
            ));
        }
        if self.levels.is_empty()
            || self.levels.len() != self.coeffs.len()
            || self.levels.len() != self.task_ids.len()
        {
            return Err(CombiError::InvalidScheme(format!(
                "{} levels, {} coefficients, {} task ids",
                self.levels.len(),
                self.coeffs.len(),
                self.task_ids.len()
            )));
        }
        if !dominates(&self.lmax, &self.lmin) {
            return Err(CombiError::InvalidScheme(
                "lmax must dominate lmin".into(),
            ));
        }
        if self.num_grids == 0 {
            return Err(CombiError::InvalidScheme("num_grids must be positive".into()));
        }
        if !self.group_assignment.is_empty() && self.group_assignment.len() != self.task_ids.len() {
            return Err(CombiError::InvalidScheme(format!(
                "{} group tags for {} tasks",
                self.group_assignment.len(),
                self.task_ids.len()
            )));
        }
        Ok(())
    }

    /// Reference box of the sparse grid: `lmax - reduce_lmax`, never below
    /// the (reduced) minimum level.
    pub fn sparse_grid_max(&self) -> LevelVector {
        (0..self.dim)
            .map(|d| {
                let reduced = self.lmax[d].saturating_sub(self.reduce_lmax[d]);
                reduced.max(self.lmin[d].saturating_sub(self.reduce_lmin[d])).max(1)
            })
            .collect()
    }

    pub fn uses_static_assignment(&self) -> bool {
        !self.group_assignment.is_empty()
    }

    /// Version-tagged encoding, all fields in fixed order.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_u16(WIRE_VERSION);
        w.put_u64(self.dim as u64);
        w.put_u32_seq(&self.lmin);
        w.put_u32_seq(&self.lmax);
        w.put_u64(self.boundary.len() as u64);
        for &b in &self.boundary {
            w.put_bool(b);
        }
        w.put_u64(self.levels.len() as u64);
        for level in &self.levels {
            w.put_u32_seq(level);
        }
        w.put_f64_seq(&self.coeffs);
        w.put_u64_seq(&self.task_ids);
        w.put_u64(self.ncombi as u64);
        w.put_u64(self.num_grids as u64);
        w.put_u64_seq(&self.parallelization.iter().map(|&p| p as u64).collect::<Vec<_>>());
        w.put_u32_seq(&self.reduce_lmin);
        w.put_u32_seq(&self.reduce_lmax);
        w.put_u16(self.element_kind.wire_code());
        match &self.third_level {
            Some(tl) => {
                w.put_bool(true);
                w.put_str(&tl.host);
                w.put_u16(tl.port);
                w.put_u64(tl.system_number as u64);
            }
            None => w.put_bool(false),
        }
        w.put_u64_seq(&self.group_assignment.iter().map(|&g| g as u64).collect::<Vec<_>>());
        w.finish()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CombiError> {
        let mut r = WireReader::new(bytes);
        let version = r.get_u16("parameter wire version")?;
        if version != WIRE_VERSION {
            return Err(CombiError::Wire(format!(
                "parameter record version {} (expected {})",
                version, WIRE_VERSION
            )));
        }
        let dim = r.get_u64("dim")? as usize;
        let lmin = r.get_u32_seq("lmin")?;
        let lmax = r.get_u32_seq("lmax")?;
        let nb = r.get_u64("boundary length")? as usize;
        let boundary = (0..nb)
            .map(|_| r.get_bool("boundary flag"))
            .collect::<Result<Vec<bool>, _>>()?;
        let nlevels = r.get_u64("level count")? as usize;
        let levels = (0..nlevels)
            .map(|_| r.get_u32_seq("level"))
            .collect::<Result<Vec<LevelVector>, _>>()?;
        let coeffs = r.get_f64_seq("coefficients")?;
        let task_ids = r.get_u64_seq("task ids")?;
        let ncombi = r.get_u64("ncombi")? as usize;
        let num_grids = r.get_u64("num_grids")? as usize;
        let parallelization = r
            .get_u64_seq("parallelization")?
            .into_iter()
            .map(|p| p as usize)
            .collect();
        let reduce_lmin = r.get_u32_seq("reduce lmin")?;
        let reduce_lmax = r.get_u32_seq("reduce lmax")?;
        let element_kind = ElementKind::from_wire_code(r.get_u16("element kind")?)
            .ok_or_else(|| CombiError::Wire("unknown element kind".into()))?;
        let third_level = if r.get_bool("third level flag")? {
            Some(ThirdLevelConfig {
                host: r.get_str("relay host")?,
                port: r.get_u16("relay port")?,
                system_number: r.get_u64("system number")? as usize,
            })
        } else {
            None
        };
        let group_assignment = r
            .get_u64_seq("group assignment")?
            .into_iter()
            .map(|g| g as usize)
            .collect();

        let params = Self {
            dim,
            lmin,
            lmax,
            boundary,
            levels,
            coeffs,
            task_ids,
            ncombi,
            num_grids,
            parallelization,
            reduce_lmin,
            reduce_lmax,
            element_kind,
            third_level,
            group_assignment,
        };
        params.validate()?;
        Ok(params)
    }
}
