use serde_json::{Map, Value, json};

use super::{Dialect, Direction, Filter, ID_FIELD, Pipeline, Projection, Sort, Stage, Update};

/// Field under which `Regroup` keeps the first row of each group.
const ROOT_SNAPSHOT: &str = "_root";

/// Compiles the algebra to the JSON query language the document engine
/// executes (MongoDB operator syntax).
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonDialect;

fn op(field: &str, operator: &str, value: &Value) -> Value {
    let mut cond = Map::new();
    cond.insert(operator.to_string(), value.clone());
    let mut doc = Map::new();
    doc.insert(field.to_string(), Value::Object(cond));
    Value::Object(doc)
}

impl Dialect for JsonDialect {
    type Filter = Value;
    type Sort = Value;
    type Projection = Value;
    type Update = Value;
    type Pipeline = Value;

    fn render_filter(&self, filter: &Filter) -> Value {
        match filter {
            Filter::All => json!({}),
            Filter::Eq(f, v) => op(f, "$eq", v),
            Filter::Ne(f, v) => op(f, "$ne", v),
            Filter::Lt(f, v) => op(f, "$lt", v),
            Filter::Lte(f, v) => op(f, "$lte", v),
            Filter::Gt(f, v) => op(f, "$gt", v),
            Filter::Gte(f, v) => op(f, "$gte", v),
            Filter::And(fs) => {
                json!({ "$and": fs.iter().map(|f| self.render_filter(f)).collect::<Vec<_>>() })
            }
            Filter::Or(fs) => {
                json!({ "$or": fs.iter().map(|f| self.render_filter(f)).collect::<Vec<_>>() })
            }
            // top-level $not does not exist; $nor of one clause negates it
            Filter::Not(f) => json!({ "$nor": [self.render_filter(f)] }),
            Filter::ElemMatch(f, inner) => op(f, "$elemMatch", &self.render_filter(inner)),
        }
    }

    fn render_sort(&self, sort: &Sort) -> Value {
        let dir = match sort.direction {
            Direction::Ascending => 1,
            Direction::Descending => -1,
        };
        let mut doc = Map::new();
        doc.insert(sort.field.clone(), json!(dir));
        Value::Object(doc)
    }

    fn render_projection(&self, projection: &Projection) -> Value {
        match projection {
            Projection::Field(f) => {
                let mut doc = Map::new();
                doc.insert(f.clone(), json!(1));
                Value::Object(doc)
            }
            Projection::IdOnly => json!({ ID_FIELD: 1 }),
        }
    }

    fn render_update(&self, update: &Update) -> Value {
        match update {
            Update::Set(f, v) => {
                let mut set = Map::new();
                set.insert(f.clone(), v.clone());
                json!({ "$set": set })
            }
            Update::SetDocument(doc) => json!({ "$set": doc }),
            Update::Push(f, v) => {
                let mut push = Map::new();
                push.insert(f.clone(), v.clone());
                json!({ "$push": push })
            }
        }
    }

    fn render_pipeline(&self, pipeline: &Pipeline) -> Value {
        let stages = pipeline
            .stages
            .iter()
            .map(|stage| match stage {
                Stage::Flatten { array } => json!({ "$unwind": format!("${array}") }),
                Stage::Filter(f) => json!({ "$match": self.render_filter(f) }),
                Stage::Sort(s) => json!({ "$sort": self.render_sort(s) }),
                Stage::Limit(n) => json!({ "$limit": n }),
                Stage::Regroup { array } => {
                    let mut group = Map::new();
                    group.insert(ID_FIELD.into(), json!(format!("${ID_FIELD}")));
                    group.insert(ROOT_SNAPSHOT.into(), json!({ "$first": "$$ROOT" }));
                    group.insert(array.clone(), json!({ "$push": format!("${array}") }));
                    json!({ "$group": group })
                }
                Stage::Merge { array } => {
                    let mut rebuilt = Map::new();
                    rebuilt.insert(array.clone(), json!(format!("${array}")));
                    json!({
                        "$replaceRoot": {
                            "newRoot": { "$mergeObjects": [format!("${ROOT_SNAPSHOT}"), rebuilt] }
                        }
                    })
                }
            })
            .collect();
        Value::Array(stages)
    }
}
