use crate::args::SimConfig;
use crate::driver::Report;
use crate::model::Tally;

pub(crate) struct Oracle;

impl Oracle {
    pub(crate) fn check(report: &Report, config: &SimConfig) -> Result<(), String> {
        let tally = &report.tally;
        let counts = &report.counts;

        let violations = Tally::get(&tally.violations);
        if violations > 0 {
            return Err(format!("{violations} handle isolation violations"));
        }
        if counts.begins != counts.commits + counts.rollbacks {
            return Err(format!(
                "transactions leaked: begins={} commits={} rollbacks={}",
                counts.begins, counts.commits, counts.rollbacks
            ));
        }
        if Tally::get(&tally.commits) != counts.commits as u64 {
            return Err(format!(
                "commit mismatch: closures={} driver={}",
                Tally::get(&tally.commits),
                counts.commits
            ));
        }

        let stats = report
            .stats
            .ok_or_else(|| "prepare mode never created a statement cache".to_string())?;
        if stats.compiles != counts.prepares as u64 {
            return Err(format!(
                "driver prepared {} statements but the cache compiled {}",
                counts.prepares, stats.compiles
            ));
        }
        if stats.compiles != stats.misses {
            return Err(format!(
                "compiled {} times for {} misses",
                stats.compiles, stats.misses
            ));
        }
        if config.cache_size > 0 && stats.len > config.cache_size {
            return Err(format!(
                "cache holds {} entries, capacity {}",
                stats.len, config.cache_size
            ));
        }
        Ok(())
    }
}
