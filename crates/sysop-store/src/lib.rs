use anyhow::{Result, anyhow};
use std::fs;
use std::path::{Path, PathBuf};
use sysop_core::Plan;
use tracing::{debug, warn};

/// Plans stored one JSON file per id. Writers are not coordinated; the last
/// save of an id wins.
#[derive(Debug, Clone)]
pub struct PlanStore {
    dir: PathBuf,
}

impl PlanStore {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn plan_path(&self, plan_id: &str) -> Result<PathBuf> {
        if plan_id.is_empty()
            || plan_id.contains(['/', '\\'])
            || plan_id.starts_with('.')
        {
            return Err(anyhow!("invalid plan id '{plan_id}'"));
        }
        Ok(self.dir.join(format!("{plan_id}.json")))
    }

    pub fn save(&self, plan: &Plan) -> Result<PathBuf> {
        let path = self.plan_path(&plan.id)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(plan)?)?;
        fs::rename(&tmp, &path)?;
        debug!(plan_id = %plan.id, path = %path.display(), "saved plan");
        Ok(path)
    }

    pub fn load(&self, plan_id: &str) -> Result<Option<Plan>> {
        let path = self.plan_path(plan_id)?;
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read(&path)?;
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    /// All readable plans, oldest first. Unreadable files are skipped.
    pub fn list(&self) -> Result<Vec<Plan>> {
        let mut plans = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read(&path)
                .map_err(anyhow::Error::from)
                .and_then(|raw| serde_json::from_slice::<Plan>(&raw).map_err(Into::into))
            {
                Ok(plan) => plans.push(plan),
                Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable plan"),
            }
        }
        plans.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(plans)
    }

    pub fn delete(&self, plan_id: &str) -> Result<bool> {
        let path = self.plan_path(plan_id)?;
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(path)?;
        Ok(true)
    }
}
