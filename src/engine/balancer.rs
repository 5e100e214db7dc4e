use super::Error;
use futures::future::BoxFuture;
use std::sync::Mutex;

type Action = Box<dyn Fn() -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;

struct TaskItem {
    action: Action,
    /// Smaller value means higher priority; 1 for the main target, 2 for
    /// auxiliaries.
    priority: u64,
    in_flight: u64,
}

/// Least-connections load balancer with failure drop.
///
/// Each dispatch picks the task minimising `in_flight * priority`, increments
/// its counter, runs the action, and decrements only on success. A failing
/// task therefore keeps its counter elevated and the balancer steers traffic
/// away from it without ever blacklisting the endpoint.
pub struct LoadBalancer {
    tasks: Mutex<Vec<TaskItem>>,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn add<F>(&self, priority: u64, action: F)
    where
        F: Fn() -> BoxFuture<'static, Result<(), Error>> + Send + Sync + 'static,
    {
        self.tasks.lock().unwrap().push(TaskItem {
            action: Box::new(action),
            priority,
            in_flight: 0,
        });
    }

    /// Run one task to completion. Safe under many concurrent callers; the
    /// task set is only locked while choosing a candidate and while adjusting
    /// counters, never across the await.
    pub async fn dispatch(&self) {
        let (idx, fut) = {
            let mut tasks = self.tasks.lock().unwrap();
            let mut candidate: Option<usize> = None;
            let mut min_weighted = u64::MAX;
            for (i, task) in tasks.iter().enumerate() {
                let weighted = task.in_flight * task.priority;
                // strict < keeps ties on insertion order
                if weighted < min_weighted {
                    min_weighted = weighted;
                    candidate = Some(i);
                }
            }
            let Some(idx) = candidate else { return };
            tasks[idx].in_flight += 1;
            (idx, (tasks[idx].action)())
        };

        let ok = fut.await.is_ok();
        if ok {
            self.tasks.lock().unwrap()[idx].in_flight -= 1;
        }
    }

    #[cfg(test)]
    fn in_flight(&self) -> Vec<u64> {
        self.tasks.lock().unwrap().iter().map(|t| t.in_flight).collect()
    }
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new()
    }
}
