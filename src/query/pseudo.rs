use serde_json::Value;

use super::{Dialect, Direction, Filter, Pipeline, Projection, Sort, Stage, Update};

/// Renders the algebra as a compact functional notation, e.g.
/// `and(eq(_id, "X"), not(elem_match(bookings, lt(start, 5))))`.
///
/// Nothing executes these strings; they exist so call sites can assert on
/// the shape of the queries they build.
#[derive(Debug, Default, Clone, Copy)]
pub struct PseudoDialect;

fn call(name: &str, args: &[String]) -> String {
    format!("{name}({})", args.join(", "))
}

fn cmp(name: &str, field: &str, value: &Value) -> String {
    call(name, &[field.to_string(), value.to_string()])
}

impl Dialect for PseudoDialect {
    type Filter = String;
    type Sort = String;
    type Projection = String;
    type Update = String;
    type Pipeline = String;

    fn render_filter(&self, filter: &Filter) -> String {
        match filter {
            Filter::All => call("all", &[]),
            Filter::Eq(f, v) => cmp("eq", f, v),
            Filter::Ne(f, v) => cmp("ne", f, v),
            Filter::Lt(f, v) => cmp("lt", f, v),
            Filter::Lte(f, v) => cmp("lte", f, v),
            Filter::Gt(f, v) => cmp("gt", f, v),
            Filter::Gte(f, v) => cmp("gte", f, v),
            Filter::And(fs) => call("and", &fs.iter().map(|f| self.render_filter(f)).collect::<Vec<_>>()),
            Filter::Or(fs) => call("or", &fs.iter().map(|f| self.render_filter(f)).collect::<Vec<_>>()),
            Filter::Not(f) => call("not", &[self.render_filter(f)]),
            Filter::ElemMatch(f, inner) => call("elem_match", &[f.clone(), self.render_filter(inner)]),
        }
    }

    fn render_sort(&self, sort: &Sort) -> String {
        let name = match sort.direction {
            Direction::Ascending => "asc",
            Direction::Descending => "desc",
        };
        call(name, &[sort.field.clone()])
    }

    fn render_projection(&self, projection: &Projection) -> String {
        match projection {
            Projection::Field(f) => call("field", &[f.clone()]),
            Projection::IdOnly => call("id_only", &[]),
        }
    }

    fn render_update(&self, update: &Update) -> String {
        match update {
            Update::Set(f, v) => cmp("set", f, v),
            Update::SetDocument(doc) => call("set_document", &[Value::Object(doc.clone()).to_string()]),
            Update::Push(f, v) => cmp("push", f, v),
        }
    }

    fn render_pipeline(&self, pipeline: &Pipeline) -> String {
        pipeline
            .stages
            .iter()
            .map(|stage| match stage {
                Stage::Flatten { array } => call("flatten", &[array.clone()]),
                Stage::Filter(f) => call("filter", &[self.render_filter(f)]),
                Stage::Sort(s) => call("sort", &[self.render_sort(s)]),
                Stage::Limit(n) => call("limit", &[n.to_string()]),
                Stage::Regroup { array } => call("regroup", &[array.clone()]),
                Stage::Merge { array } => call("merge", &[array.clone()]),
            })
            .collect::<Vec<_>>()
            .join(" | ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_filter_shape() {
        let f = Filter::and([
            Filter::eq("_id", "X"),
            Filter::not(Filter::elem_match(
                "bookings",
                Filter::and([Filter::lt("start", 20), Filter::gt("end", 10)]),
            )),
        ]);
        assert_eq!(
            PseudoDialect.render_filter(&f),
            r#"and(eq(_id, "X"), not(elem_match(bookings, and(lt(start, 20), gt(end, 10)))))"#
        );
        assert_eq!(PseudoDialect.render_filter(&Filter::All), "all()");
        assert_eq!(
            PseudoDialect.render_filter(&Filter::or([Filter::ne("a", 1), Filter::gte("b", 2)])),
            "or(ne(a, 1), gte(b, 2))"
        );
    }

    #[test]
    fn renders_update_and_projection_shape() {
        assert_eq!(
            PseudoDialect.render_update(&Update::push("bookings", json!({"id": "q"}))),
            r#"push(bookings, {"id":"q"})"#
        );
        assert_eq!(PseudoDialect.render_projection(&Projection::IdOnly), "id_only()");
        assert_eq!(PseudoDialect.render_sort(&Sort::desc("start")), "desc(start)");
    }

    #[test]
    fn renders_pipeline_shape() {
        let p = Pipeline::array_flatten_filter_limit(
            "bookings",
            &Filter::eq("customer_id", "c1"),
            Some(2),
            Some(&Sort::asc("start")),
        );
        assert_eq!(
            PseudoDialect.render_pipeline(&p),
            r#"flatten(bookings) | filter(eq(bookings.customer_id, "c1")) | sort(asc(bookings.start)) | limit(2) | regroup(bookings) | merge(bookings) | sort(asc(bookings.start))"#
        );
    }
}
